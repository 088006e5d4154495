// Shell - interactive command loop driving the desk service

pub mod guard;
pub mod route;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error::{AppError, AppResult};
use crate::form::FormState;
use crate::records::{DeleteResult, EntitySummary, ImportHit};
use crate::service::DeskService;
use crate::views;
use guard::{NavGuard, NavOutcome};
use route::Route;

/// One editing surface. An embedded creation, opened from a relation
/// field of the form below it, remembers the field to link back into.
struct EditFrame {
    entity_type: String,
    uid: Option<String>,
    form: FormState,
    parent_path: Option<String>,
    return_route: Route,
}

/// Action held back until the user answers yes or no.
enum PendingAction {
    Nav(Route),
    Exit,
    CloseFrame,
    Delete { entity_type: String, uid: String },
}

/// Candidate list shown for one relation field, picked from with `#n`.
struct CandidateSet {
    path: String,
    items: Vec<EntitySummary>,
}

/// Import search results held for a follow-up `import add <n>`.
struct ImportContext {
    entity_type: String,
    slug: String,
    hits: Vec<ImportHit>,
}

/// What one line of input produced.
#[derive(Debug)]
pub struct ShellReply {
    pub output: String,
    pub exit: bool,
}

impl ShellReply {
    fn text(output: String) -> Self {
        Self {
            output,
            exit: false,
        }
    }
}

pub struct Shell {
    service: DeskService,
    max_inline_depth: usize,
    route: Route,
    frames: Vec<EditFrame>,
    guard: NavGuard,
    pending: Option<PendingAction>,
    candidates: Option<CandidateSet>,
    last_import: Option<ImportContext>,
}

impl Shell {
    pub fn new(service: DeskService, max_inline_depth: usize) -> Self {
        Self {
            service,
            max_inline_depth,
            route: Route::Home,
            frames: Vec::new(),
            guard: NavGuard::new(),
            pending: None,
            candidates: None,
            last_import: None,
        }
    }

    pub fn prompt(&self) -> String {
        let dirty = if self.guard.is_active() { "*" } else { "" };
        format!("graphdesk[{}]{}> ", self.route.path(), dirty)
    }

    /// Reads commands until exit. Ctrl-C clears the line, Ctrl-D ends
    /// the session like `exit` does.
    pub async fn run(&mut self) -> AppResult<()> {
        let mut editor = DefaultEditor::new().map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to start the line editor: {}", e))
        })?;
        println!("graphdesk (type help for commands, exit to quit).");

        loop {
            match editor.readline(&self.prompt()) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(trimmed);
                    let reply = self.handle_line(trimmed).await;
                    if !reply.output.is_empty() {
                        println!("{}", reply.output.trim_end());
                    }
                    if reply.exit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("(interrupt)");
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(e) => {
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "Failed to read input: {}",
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Handles one input line; errors come back as output text so the
    /// loop never dies on a bad command.
    pub async fn handle_line(&mut self, line: &str) -> ShellReply {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ShellReply::text(String::new());
        }
        if self.pending.is_some() {
            return self.handle_confirmation(trimmed).await;
        }
        match self.dispatch(trimmed).await {
            Ok(reply) => reply,
            Err(e) => ShellReply::text(format!("error: {}", e)),
        }
    }

    async fn dispatch(&mut self, line: &str) -> AppResult<ShellReply> {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(word) => word.to_lowercase(),
            None => return Ok(ShellReply::text(String::new())),
        };
        let args: Vec<&str> = parts.collect();

        match command.as_str() {
            "help" => Ok(ShellReply::text(help_text())),
            "exit" | "quit" => self.request_exit(),
            "go" => match args.as_slice() {
                [path] => {
                    let route = Route::parse(path)?;
                    self.request_nav(route).await
                }
                _ => Err(usage("go <path>")),
            },
            "types" | "ls" => Ok(ShellReply::text(views::render_types(self.service.schema()))),
            "login" => match args.as_slice() {
                [username, password] => {
                    self.service.login(username, password).await?;
                    Ok(ShellReply::text(format!("Logged in as {}.", username)))
                }
                _ => Err(usage("login <username> <password>")),
            },
            "logout" => {
                self.service.logout().await?;
                Ok(ShellReply::text("Logged out.".to_string()))
            }
            "whoami" => Ok(ShellReply::text(self.whoami_text().await)),
            "list" => {
                let entity_type = args.first().ok_or_else(|| usage("list <type> [filter]"))?;
                let filter = if args.len() > 1 {
                    Some(args[1..].join(" "))
                } else {
                    None
                };
                self.request_nav(Route::EntityList {
                    entity_type: entity_type.to_lowercase(),
                    filter,
                })
                .await
            }
            "open" => match args.as_slice() {
                [uid] => {
                    let entity_type = self
                        .route
                        .entity_type()
                        .ok_or_else(|| usage("open <type> <uid>"))?
                        .to_string();
                    self.request_nav(Route::EntityDetail {
                        entity_type,
                        uid: uid.to_string(),
                    })
                    .await
                }
                [entity_type, uid] => {
                    self.request_nav(Route::EntityDetail {
                        entity_type: entity_type.to_lowercase(),
                        uid: uid.to_string(),
                    })
                    .await
                }
                _ => Err(usage("open [<type>] <uid>")),
            },
            "refresh" => {
                let entity_type = match args.first() {
                    Some(t) => t.to_lowercase(),
                    None => self
                        .route
                        .entity_type()
                        .map(str::to_string)
                        .ok_or_else(|| usage("refresh <type>"))?,
                };
                let items = self.service.refresh_list(&entity_type).await?;
                self.route = Route::EntityList {
                    entity_type: entity_type.clone(),
                    filter: None,
                };
                Ok(ShellReply::text(views::render_list(
                    self.service.schema(),
                    &entity_type,
                    &items,
                    None,
                )))
            }
            "new" => {
                if !self.frames.is_empty() {
                    return Err(AppError::InvalidCommand(
                        "A form is open; save or cancel it first".to_string(),
                    ));
                }
                let entity_type = args.first().ok_or_else(|| usage("new <type>"))?;
                self.open_new(&entity_type.to_lowercase())
            }
            "edit" => {
                if !self.frames.is_empty() {
                    return Err(AppError::InvalidCommand(
                        "A form is open; save or cancel it first".to_string(),
                    ));
                }
                let (entity_type, uid) = self.target_record(&args)?;
                self.open_edit(&entity_type, &uid).await
            }
            "merge" => self.cmd_merge(&args).await,
            "set" => {
                if args.len() < 2 {
                    return Err(usage("set <field> <value>"));
                }
                let raw = args[1..].join(" ");
                {
                    let frame = top_frame(&mut self.frames)?;
                    frame.form.set_field(self.service.schema(), args[0], &raw)?;
                }
                self.sync_guard();
                self.render_top_form()
            }
            "unset" => match args.as_slice() {
                [path] => {
                    {
                        let frame = top_frame(&mut self.frames)?;
                        frame.form.unset(self.service.schema(), path)?;
                    }
                    self.sync_guard();
                    self.render_top_form()
                }
                _ => Err(usage("unset <field>")),
            },
            "add" => {
                if args.len() < 2 {
                    return Err(usage("add <field> <query|#n>  or  add <field> --new <type>"));
                }
                if args[1] == "--new" {
                    let subtype = args
                        .get(2)
                        .ok_or_else(|| usage("add <field> --new <type>"))?
                        .to_lowercase();
                    self.open_embedded(args[0], &subtype)
                } else {
                    let token = args[1..].join(" ");
                    self.add_link(args[0], &token).await
                }
            }
            "remove" => match args.as_slice() {
                [path, uid] => {
                    {
                        let frame = top_frame(&mut self.frames)?;
                        frame.form.remove_target(self.service.schema(), path, uid)?;
                    }
                    self.sync_guard();
                    self.render_top_form()
                }
                _ => Err(usage("remove <field> <uid>")),
            },
            "edge" => {
                if args.len() < 4 {
                    return Err(usage("edge <field> <uid> <edge-field> <value>"));
                }
                let raw = args[3..].join(" ");
                {
                    let frame = top_frame(&mut self.frames)?;
                    frame
                        .form
                        .set_edge(self.service.schema(), args[0], args[1], args[2], &raw)?;
                }
                self.sync_guard();
                self.render_top_form()
            }
            "save" => self.cmd_save().await,
            "cancel" => self.cmd_cancel(),
            "back" => {
                if !self.frames.is_empty() {
                    return self.cmd_cancel();
                }
                let route = match &self.route {
                    Route::EntityDetail { entity_type, .. }
                    | Route::EntityMerge { entity_type, .. } => Route::EntityList {
                        entity_type: entity_type.clone(),
                        filter: None,
                    },
                    _ => Route::Home,
                };
                self.request_nav(route).await
            }
            "delete" => {
                let (entity_type, uid) = self.target_record(&args)?;
                let display = self.service.schema().display_name(&entity_type);
                let prompt = format!("Delete {} {}?", display, uid);
                self.pending = Some(PendingAction::Delete { entity_type, uid });
                Ok(confirm_reply(&prompt))
            }
            "restore" => {
                let (entity_type, uid) = self.target_record(&args)?;
                self.do_restore(&entity_type, &uid).await
            }
            "import" => {
                if args.first() == Some(&"add") {
                    let n: usize = args
                        .get(1)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| usage("import add <n>"))?;
                    self.import_add(n).await
                } else {
                    if args.len() < 2 {
                        return Err(usage("import <type> <query>"));
                    }
                    let entity_type = args[0].to_lowercase();
                    let query = args[1..].join(" ");
                    let (slug, list) =
                        self.service.import_search(&entity_type, None, &query).await?;
                    let mut out = views::render_import_hits(&list);
                    out.push_str("Use: import add <n>\n");
                    self.last_import = Some(ImportContext {
                        entity_type,
                        slug,
                        hits: list.data,
                    });
                    Ok(ShellReply::text(out))
                }
            }
            _ => Err(AppError::InvalidCommand(format!(
                "Unknown command '{}'; try help",
                command
            ))),
        }
    }

    // ========== Confirmation ==========

    async fn handle_confirmation(&mut self, input: &str) -> ShellReply {
        match input.to_lowercase().as_str() {
            "yes" | "y" => {
                let action = match self.pending.take() {
                    Some(action) => action,
                    None => return ShellReply::text(String::new()),
                };
                let result = match action {
                    PendingAction::Nav(route) => {
                        self.guard.deactivate();
                        self.perform_nav(route).await
                    }
                    PendingAction::Exit => {
                        return ShellReply {
                            output: "Goodbye!".to_string(),
                            exit: true,
                        };
                    }
                    PendingAction::CloseFrame => self.close_top_frame(),
                    PendingAction::Delete { entity_type, uid } => {
                        self.do_delete(&entity_type, &uid).await
                    }
                };
                match result {
                    Ok(reply) => reply,
                    Err(e) => ShellReply::text(format!("error: {}", e)),
                }
            }
            "no" | "n" => {
                self.pending = None;
                ShellReply::text("Cancelled.".to_string())
            }
            _ => ShellReply::text("Please answer yes or no.".to_string()),
        }
    }

    fn request_exit(&mut self) -> AppResult<ShellReply> {
        match self.guard.check() {
            NavOutcome::NeedsConfirmation(prompt) => {
                self.pending = Some(PendingAction::Exit);
                Ok(confirm_reply(prompt))
            }
            NavOutcome::Proceed => Ok(ShellReply {
                output: "Goodbye!".to_string(),
                exit: true,
            }),
        }
    }

    // ========== Navigation ==========

    async fn request_nav(&mut self, route: Route) -> AppResult<ShellReply> {
        match self.guard.check() {
            NavOutcome::NeedsConfirmation(prompt) => {
                self.pending = Some(PendingAction::Nav(route));
                Ok(confirm_reply(prompt))
            }
            NavOutcome::Proceed => self.perform_nav(route).await,
        }
    }

    async fn perform_nav(&mut self, route: Route) -> AppResult<ShellReply> {
        self.frames.clear();
        self.guard.deactivate();
        self.candidates = None;
        match route {
            Route::Home => {
                self.route = Route::Home;
                let mut out = views::render_types(self.service.schema());
                out.push_str("Use: list <type>\n");
                Ok(ShellReply::text(out))
            }
            Route::Login => {
                self.route = Route::Login;
                Ok(ShellReply::text(
                    "Use: login <username> <password>".to_string(),
                ))
            }
            Route::EntityList {
                entity_type,
                filter,
            } => self.show_list(&entity_type, filter.as_deref()).await,
            Route::EntityNew { entity_type } => self.open_new(&entity_type),
            Route::EntityDetail { entity_type, uid } => {
                self.show_detail(&entity_type, &uid).await
            }
            Route::EntityEdit { entity_type, uid } => self.open_edit(&entity_type, &uid).await,
            Route::EntityMerge { entity_type, uid } => {
                let mut reply = self.show_detail(&entity_type, &uid).await?;
                self.route = Route::EntityMerge {
                    entity_type,
                    uid,
                };
                reply.output.push_str("Use: merge <other-uid> to compare.\n");
                Ok(reply)
            }
        }
    }

    async fn show_list(&mut self, entity_type: &str, filter: Option<&str>) -> AppResult<ShellReply> {
        let items = self.service.list(entity_type, filter).await?;
        self.route = Route::EntityList {
            entity_type: entity_type.to_lowercase(),
            filter: filter.map(str::to_string),
        };
        Ok(ShellReply::text(views::render_list(
            self.service.schema(),
            entity_type,
            &items,
            filter,
        )))
    }

    async fn show_detail(&mut self, entity_type: &str, uid: &str) -> AppResult<ShellReply> {
        let record = self.service.record(entity_type, uid).await?;
        let out = views::render_detail(
            self.service.schema(),
            entity_type,
            &record,
            self.max_inline_depth,
        )?;
        self.route = Route::EntityDetail {
            entity_type: entity_type.to_lowercase(),
            uid: uid.to_string(),
        };
        Ok(ShellReply::text(out))
    }

    /// The record a record command is about: named in the arguments,
    /// or the one the current page is pinned to.
    fn target_record(&self, args: &[&str]) -> AppResult<(String, String)> {
        match args {
            [entity_type, uid] => Ok((entity_type.to_lowercase(), uid.to_string())),
            [] => match (self.route.entity_type(), self.route.uid()) {
                (Some(entity_type), Some(uid)) => {
                    Ok((entity_type.to_string(), uid.to_string()))
                }
                _ => Err(AppError::InvalidCommand(
                    "Open a record first, or name one: <type> <uid>".to_string(),
                )),
            },
            _ => Err(AppError::InvalidCommand(
                "Name a record: <type> <uid>".to_string(),
            )),
        }
    }

    // ========== Forms ==========

    fn open_new(&mut self, entity_type: &str) -> AppResult<ShellReply> {
        let desc = self.service.schema().descriptor(entity_type)?;
        if desc.meta.is_abstract {
            return Err(AppError::SchemaError(format!(
                "'{}' is abstract; create one of its concrete subtypes",
                entity_type
            )));
        }
        if desc.meta.inline_only {
            return Err(AppError::SchemaError(format!(
                "'{}' lives inside other records; create it there",
                entity_type
            )));
        }
        let form = FormState::blank(self.service.schema(), entity_type)?;
        self.frames.push(EditFrame {
            entity_type: entity_type.to_string(),
            uid: None,
            form,
            parent_path: None,
            return_route: self.route.clone(),
        });
        self.route = Route::EntityNew {
            entity_type: entity_type.to_string(),
        };
        self.render_top_form()
    }

    async fn open_edit(&mut self, entity_type: &str, uid: &str) -> AppResult<ShellReply> {
        let record = self.service.record(entity_type, uid).await?;
        if record.is_deleted() {
            return Err(AppError::Validation(
                "This entity is marked for deletion; restore it before editing".to_string(),
            ));
        }
        let form = FormState::from_record(self.service.schema(), entity_type, record)?;
        self.frames.push(EditFrame {
            entity_type: entity_type.to_lowercase(),
            uid: Some(uid.to_string()),
            form,
            parent_path: None,
            return_route: self.route.clone(),
        });
        self.route = Route::EntityEdit {
            entity_type: entity_type.to_lowercase(),
            uid: uid.to_string(),
        };
        self.render_top_form()
    }

    /// Opens a create form for `subtype` on top of the current one;
    /// saving links the new record into the field at `path`.
    fn open_embedded(&mut self, path: &str, subtype: &str) -> AppResult<ShellReply> {
        let target = {
            let frame = self.frames.last().ok_or_else(no_form_error)?;
            frame
                .form
                .relation_target_type(self.service.schema(), path)?
        };
        let options = self.service.schema().inline_subtype_options(&target)?;
        if !options.iter().any(|o| o == subtype) {
            return Err(AppError::InvalidCommand(format!(
                "'{}' is not one of: {}",
                subtype,
                options.join(", ")
            )));
        }
        let form = FormState::blank(self.service.schema(), subtype)?;
        let return_route = self.route.clone();
        self.frames.push(EditFrame {
            entity_type: subtype.to_string(),
            uid: None,
            form,
            parent_path: Some(path.to_string()),
            return_route,
        });
        self.route = Route::EntityNew {
            entity_type: subtype.to_string(),
        };
        let mut reply = self.render_top_form()?;
        reply.output = format!(
            "Creating {} to link into '{}'.\n{}",
            self.service.schema().display_name(subtype),
            path,
            reply.output
        );
        Ok(reply)
    }

    async fn add_link(&mut self, path: &str, token: &str) -> AppResult<ShellReply> {
        // #n picks from the candidate list shown for this field
        if let Some(rest) = token.strip_prefix('#') {
            let idx: usize = rest.trim().parse().map_err(|_| {
                AppError::InvalidCommand("Candidate picks look like '#2'".to_string())
            })?;
            let target = {
                let set = self.candidates.as_ref().ok_or_else(|| {
                    AppError::InvalidCommand(
                        "No candidate list is open; search first".to_string(),
                    )
                })?;
                if set.path != path {
                    return Err(AppError::InvalidCommand(format!(
                        "The candidate list is for '{}'",
                        set.path
                    )));
                }
                idx.checked_sub(1)
                    .and_then(|i| set.items.get(i))
                    .cloned()
                    .ok_or_else(|| {
                        AppError::InvalidCommand(format!(
                            "The list has {} candidates",
                            set.items.len()
                        ))
                    })?
            };
            {
                let frame = top_frame(&mut self.frames)?;
                frame.form.add_target(self.service.schema(), path, &target)?;
            }
            self.candidates = None;
            self.sync_guard();
            return self.render_top_form();
        }

        let target_type = {
            let frame = self.frames.last().ok_or_else(no_form_error)?;
            frame
                .form
                .relation_target_type(self.service.schema(), path)?
        };
        let all = self.service.autocomplete_candidates(&target_type).await?;

        // An exact uid bypasses the query match.
        if let Some(direct) = all.iter().find(|c| c.uid == token).cloned() {
            {
                let frame = top_frame(&mut self.frames)?;
                frame.form.add_target(self.service.schema(), path, &direct)?;
            }
            self.sync_guard();
            return self.render_top_form();
        }

        let matches = {
            let frame = self.frames.last().ok_or_else(no_form_error)?;
            frame
                .form
                .matching_candidates(self.service.schema(), path, token, &all)?
        };
        match matches.len() {
            0 => Ok(ShellReply::text(format!(
                "No unlinked {} matches '{}'",
                self.service.schema().display_name(&target_type),
                token
            ))),
            1 => {
                {
                    let frame = top_frame(&mut self.frames)?;
                    frame
                        .form
                        .add_target(self.service.schema(), path, &matches[0])?;
                }
                self.sync_guard();
                self.render_top_form()
            }
            _ => {
                let mut out = String::new();
                for (idx, candidate) in matches.iter().enumerate() {
                    out.push_str(&format!(
                        "  [{}] {} [{}] ({})\n",
                        idx + 1,
                        candidate.label,
                        candidate.real_type,
                        candidate.uid
                    ));
                }
                out.push_str(&format!("Several match; use: add {} #<n>\n", path));
                self.candidates = Some(CandidateSet {
                    path: path.to_string(),
                    items: matches,
                });
                Ok(ShellReply::text(out))
            }
        }
    }

    async fn cmd_save(&mut self) -> AppResult<ShellReply> {
        let report = {
            let frame = top_frame(&mut self.frames)?;
            frame.form.validate(self.service.schema())?
        };
        if !report.is_valid() {
            let mut reply = self.render_top_form()?;
            reply.output.push_str("Fix the errors above, then save again.\n");
            return Ok(reply);
        }

        let (entity_type, uid, payload, parent_path) = {
            let frame = self.frames.last().ok_or_else(no_form_error)?;
            (
                frame.entity_type.clone(),
                frame.uid.clone(),
                frame.form.payload().clone(),
                frame.parent_path.clone(),
            )
        };

        match uid {
            None => {
                let outcome = self.service.create(&entity_type, &payload).await?;
                if !outcome.saved {
                    return Err(AppError::Api(format!(
                        "The server did not save the new {}",
                        entity_type
                    )));
                }
                let label = if outcome.label.is_empty() {
                    outcome.uid.clone()
                } else {
                    outcome.label.clone()
                };
                self.frames.pop();
                match parent_path {
                    Some(path) => {
                        {
                            let frame = top_frame(&mut self.frames)?;
                            frame.form.add_created_target(
                                self.service.schema(),
                                &path,
                                &outcome.uid,
                                &label,
                                &entity_type,
                            )?;
                            self.route = match &frame.uid {
                                Some(uid) => Route::EntityEdit {
                                    entity_type: frame.entity_type.clone(),
                                    uid: uid.clone(),
                                },
                                None => Route::EntityNew {
                                    entity_type: frame.entity_type.clone(),
                                },
                            };
                        }
                        self.sync_guard();
                        let mut reply = self.render_top_form()?;
                        reply.output = format!(
                            "Created {} ({}) and linked it into '{}'.\n{}",
                            label, outcome.uid, path, reply.output
                        );
                        Ok(reply)
                    }
                    None => {
                        self.sync_guard();
                        let mut reply = self.show_detail(&entity_type, &outcome.uid).await?;
                        reply.output =
                            format!("Created {} ({}).\n{}", label, outcome.uid, reply.output);
                        Ok(reply)
                    }
                }
            }
            Some(uid) => {
                let outcome = self.service.update(&entity_type, &uid, &payload).await?;
                if !outcome.saved {
                    return Err(AppError::Api(format!(
                        "The server did not accept the changes to {}",
                        uid
                    )));
                }
                self.frames.pop();
                self.sync_guard();
                let mut reply = self.show_detail(&entity_type, &uid).await?;
                reply.output = format!("Saved.\n{}", reply.output);
                Ok(reply)
            }
        }
    }

    fn cmd_cancel(&mut self) -> AppResult<ShellReply> {
        let dirty = self
            .frames
            .last()
            .map(|frame| frame.form.is_dirty())
            .unwrap_or(false);
        if self.frames.is_empty() {
            return Err(no_form_error());
        }
        if dirty {
            self.pending = Some(PendingAction::CloseFrame);
            return Ok(confirm_reply(guard::LEAVE_PROMPT));
        }
        self.close_top_frame()
    }

    fn close_top_frame(&mut self) -> AppResult<ShellReply> {
        let frame = self.frames.pop().ok_or_else(no_form_error)?;
        self.sync_guard();
        if let Some(parent) = self.frames.last() {
            self.route = match &parent.uid {
                Some(uid) => Route::EntityEdit {
                    entity_type: parent.entity_type.clone(),
                    uid: uid.clone(),
                },
                None => Route::EntityNew {
                    entity_type: parent.entity_type.clone(),
                },
            };
            let mut reply = self.render_top_form()?;
            reply.output = format!("Closed the {} form.\n{}", frame.entity_type, reply.output);
            return Ok(reply);
        }
        self.route = frame.return_route;
        Ok(ShellReply::text(format!(
            "Closed the {} form.",
            frame.entity_type
        )))
    }

    fn render_top_form(&self) -> AppResult<ShellReply> {
        let frame = self.frames.last().ok_or_else(no_form_error)?;
        let out = views::render_form(self.service.schema(), &frame.form, self.max_inline_depth)?;
        Ok(ShellReply::text(out))
    }

    fn sync_guard(&mut self) {
        if self.frames.iter().any(|frame| frame.form.is_dirty()) {
            self.guard.activate();
        } else {
            self.guard.deactivate();
        }
    }

    // ========== Record actions ==========

    async fn do_delete(&mut self, entity_type: &str, uid: &str) -> AppResult<ShellReply> {
        let outcome = self.service.delete(entity_type, uid).await?;
        match outcome.result {
            DeleteResult::Fail => Err(AppError::Api(if outcome.detail.is_empty() {
                format!("Could not delete {} {}", entity_type, uid)
            } else {
                outcome.detail
            })),
            DeleteResult::Success | DeleteResult::Pending => {
                let message = if outcome.detail.is_empty() {
                    "Deleted.".to_string()
                } else {
                    outcome.detail
                };
                self.reshow_after_action(entity_type, uid, message).await
            }
        }
    }

    async fn do_restore(&mut self, entity_type: &str, uid: &str) -> AppResult<ShellReply> {
        let outcome = self.service.restore(entity_type, uid).await?;
        match outcome.result {
            DeleteResult::Fail => Err(AppError::Api(if outcome.detail.is_empty() {
                format!("Could not restore {} {}", entity_type, uid)
            } else {
                outcome.detail
            })),
            DeleteResult::Success | DeleteResult::Pending => {
                let message = if outcome.detail.is_empty() {
                    "Restored.".to_string()
                } else {
                    outcome.detail
                };
                self.reshow_after_action(entity_type, uid, message).await
            }
        }
    }

    /// After a delete or restore, stays on the page when the record
    /// still exists and falls back to the list when it is gone.
    async fn reshow_after_action(
        &mut self,
        entity_type: &str,
        uid: &str,
        message: String,
    ) -> AppResult<ShellReply> {
        if self.route.uid() != Some(uid) {
            return Ok(ShellReply::text(message));
        }
        match self.show_detail(entity_type, uid).await {
            Ok(mut reply) => {
                reply.output = format!("{}\n{}", message, reply.output);
                Ok(reply)
            }
            Err(AppError::NotFound(_)) => {
                let mut reply = self.show_list(entity_type, None).await?;
                reply.output = format!("{}\n{}", message, reply.output);
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }

    async fn cmd_merge(&mut self, args: &[&str]) -> AppResult<ShellReply> {
        let (entity_type, uid, other) = match args {
            [other] => match (self.route.entity_type(), self.route.uid()) {
                (Some(entity_type), Some(uid)) => {
                    (entity_type.to_string(), uid.to_string(), other.to_string())
                }
                _ => {
                    return Err(AppError::InvalidCommand(
                        "Open a record first, or use: merge <type> <uid> <other-uid>"
                            .to_string(),
                    ));
                }
            },
            [entity_type, uid, other] => {
                (entity_type.to_lowercase(), uid.to_string(), other.to_string())
            }
            _ => return Err(usage("merge <other-uid>  or  merge <type> <uid> <other-uid>")),
        };

        let desc = self.service.schema().descriptor(&entity_type)?;
        if !desc.meta.mergeable {
            return Err(AppError::SchemaError(format!(
                "'{}' records cannot be merged",
                entity_type
            )));
        }
        let left = self.service.record(&entity_type, &uid).await?;
        let right = match self.service.record(&entity_type, &other).await {
            Ok(record) => record,
            // Not a uid; resolve it as a label query over the
            // autocomplete candidates.
            Err(AppError::NotFound(_)) => {
                let candidates = self.service.autocomplete_candidates(&entity_type).await?;
                let needle = other.to_lowercase();
                let matches: Vec<&EntitySummary> = candidates
                    .iter()
                    .filter(|c| c.uid != uid && c.label.to_lowercase().contains(&needle))
                    .collect();
                match matches.as_slice() {
                    [single] => self.service.record(&entity_type, &single.uid).await?,
                    [] => {
                        return Err(AppError::NotFound(format!(
                            "No {} matches '{}'",
                            self.service.schema().display_name(&entity_type),
                            other
                        )));
                    }
                    several => {
                        let mut out = String::new();
                        for candidate in several {
                            out.push_str(&format!(
                                "  {}  {}\n",
                                candidate.uid, candidate.label
                            ));
                        }
                        out.push_str("Several match; merge with one of the uids.\n");
                        return Ok(ShellReply::text(out));
                    }
                }
            }
            Err(e) => return Err(e),
        };
        let out = views::render_merge(self.service.schema(), &entity_type, &left, &right)?;
        self.route = Route::EntityMerge {
            entity_type,
            uid,
        };
        Ok(ShellReply::text(out))
    }

    // ========== Import ==========

    async fn import_add(&mut self, n: usize) -> AppResult<ShellReply> {
        let (entity_type, slug, uri) = {
            let ctx = self.last_import.as_ref().ok_or_else(|| {
                AppError::InvalidCommand("No import search is open; use: import <type> <query>".to_string())
            })?;
            let hit = n
                .checked_sub(1)
                .and_then(|i| ctx.hits.get(i))
                .ok_or_else(|| {
                    AppError::InvalidCommand(format!(
                        "The search returned {} hits",
                        ctx.hits.len()
                    ))
                })?;
            (ctx.entity_type.clone(), ctx.slug.clone(), hit.uri.clone())
        };
        let created = self.service.import_create(&entity_type, &slug, &[uri]).await?;
        if created.is_empty() {
            return Ok(ShellReply::text("Nothing imported.".to_string()));
        }
        let mut out = String::new();
        for entity in &created {
            out.push_str(&format!("Imported {} ({})\n", entity.label, entity.uid));
        }
        Ok(ShellReply::text(out))
    }

    // ========== Session ==========

    async fn whoami_text(&self) -> String {
        match self.service.current_username().await {
            Some(username) => {
                let mut out = format!("Logged in as {}", username);
                if let Some(expiry) = self.service.access_expiry().await {
                    out.push_str(&format!(
                        " (access token valid until {})",
                        expiry.to_rfc3339()
                    ));
                }
                out
            }
            None => "Not logged in.".to_string(),
        }
    }
}

fn top_frame(frames: &mut [EditFrame]) -> AppResult<&mut EditFrame> {
    frames.last_mut().ok_or_else(no_form_error)
}

fn no_form_error() -> AppError {
    AppError::InvalidCommand("No form is open; use new or edit".to_string())
}

fn usage(text: &str) -> AppError {
    AppError::InvalidCommand(format!("Use: {}", text))
}

fn confirm_reply(prompt: &str) -> ShellReply {
    ShellReply::text(format!("{} (yes/no)", prompt))
}

fn help_text() -> String {
    let mut out = String::from("Commands:\n");
    for line in [
        "types | ls                      entity type directory",
        "list <type> [filter]            list records of a type",
        "open [<type>] <uid>             show one record",
        "go <path>                       navigate by page path",
        "refresh [type]                  drop the cached list and refetch",
        "new <type>                      open a create form",
        "edit [<type> <uid>]             edit a record",
        "set <field> <value>             set a property or inline subtype",
        "unset <field>                   clear a field",
        "add <field> <query|#n>          link a matching record",
        "add <field> --new <type>        create and link a new record",
        "remove <field> <uid>            unlink a target",
        "edge <field> <uid> <prop> <v>   set a property on the link itself",
        "save | cancel | back            close the open form",
        "delete | restore [<type> <uid>] soft-delete or restore a record",
        "merge <uid|query>               compare two records of a type",
        "import <type> <query>           search an import source",
        "import add <n>                  import a search hit",
        "login <user> <pass> | logout | whoami",
        "help | exit",
    ] {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}
