// Route - page paths the shell can stand on

use std::fmt;

use crate::error::{AppError, AppResult};

/// Pages of the application, addressed by the same paths the hosted
/// frontend serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    Login,
    EntityList {
        entity_type: String,
        filter: Option<String>,
    },
    EntityNew {
        entity_type: String,
    },
    EntityDetail {
        entity_type: String,
        uid: String,
    },
    EntityEdit {
        entity_type: String,
        uid: String,
    },
    EntityMerge {
        entity_type: String,
        uid: String,
    },
}

impl Route {
    /// Parses a path like `/entity/person/p23/edit/`. Trailing slashes
    /// are optional; list routes honor a `?filter=` query.
    pub fn parse(path: &str) -> AppResult<Self> {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let filter = query.and_then(|q| {
            q.split('&').find_map(|pair| {
                pair.strip_prefix("filter=")
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
        });

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let route = match segments.as_slice() {
            [] => Route::Home,
            ["login"] => Route::Login,
            ["entity", entity_type] => Route::EntityList {
                entity_type: entity_type.to_lowercase(),
                filter,
            },
            ["entity", entity_type, "new"] => Route::EntityNew {
                entity_type: entity_type.to_lowercase(),
            },
            ["entity", entity_type, uid] => Route::EntityDetail {
                entity_type: entity_type.to_lowercase(),
                uid: uid.to_string(),
            },
            ["entity", entity_type, uid, "edit"] => Route::EntityEdit {
                entity_type: entity_type.to_lowercase(),
                uid: uid.to_string(),
            },
            ["entity", entity_type, uid, "merge"] => Route::EntityMerge {
                entity_type: entity_type.to_lowercase(),
                uid: uid.to_string(),
            },
            _ => {
                return Err(AppError::InvalidCommand(format!(
                    "No page at '{}'",
                    path
                )));
            }
        };
        Ok(route)
    }

    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".to_string(),
            Route::Login => "/login/".to_string(),
            Route::EntityList {
                entity_type,
                filter: None,
            } => format!("/entity/{}/", entity_type),
            Route::EntityList {
                entity_type,
                filter: Some(filter),
            } => format!("/entity/{}/?filter={}", entity_type, filter),
            Route::EntityNew { entity_type } => format!("/entity/{}/new/", entity_type),
            Route::EntityDetail { entity_type, uid } => {
                format!("/entity/{}/{}/", entity_type, uid)
            }
            Route::EntityEdit { entity_type, uid } => {
                format!("/entity/{}/{}/edit/", entity_type, uid)
            }
            Route::EntityMerge { entity_type, uid } => {
                format!("/entity/{}/{}/merge/", entity_type, uid)
            }
        }
    }

    /// The type a page is about, when it is about one.
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Route::Home | Route::Login => None,
            Route::EntityList { entity_type, .. }
            | Route::EntityNew { entity_type }
            | Route::EntityDetail { entity_type, .. }
            | Route::EntityEdit { entity_type, .. }
            | Route::EntityMerge { entity_type, .. } => Some(entity_type),
        }
    }

    /// The record a page is pinned to, when it is pinned to one.
    pub fn uid(&self) -> Option<&str> {
        match self {
            Route::EntityDetail { uid, .. }
            | Route::EntityEdit { uid, .. }
            | Route::EntityMerge { uid, .. } => Some(uid),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}
