//! Decides what an inbound message is for.
//!
//! Commands win, then active interceptors (callers waiting for a matching
//! message), then the first special handler whose check accepts the message.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::args::Argspec;
use crate::platform::Message;

/// A registered command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Name including the prefix, lower case.
    pub name: String,
    pub help: Option<String>,
    pub argspec: Argspec,
    pub delimiter: Option<String>,
}

impl CommandSpec {
    /// Split the message body after the command word into argument tokens.
    ///
    /// The delimiter is used only when it appears in the body and delimiters
    /// are not disabled; otherwise tokens are whitespace separated.
    pub fn split_args(&self, content: &str, disable_delimiters: bool) -> Vec<String> {
        let body = content.trim();
        let body = body
            .split_once(char::is_whitespace)
            .map_or("", |(_, rest)| rest)
            .trim();
        match self.delimiter.as_deref() {
            Some(delimiter) if !disable_delimiters && body.contains(delimiter) => body
                .split(delimiter)
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(str::to_string)
                .collect(),
            _ => body.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Predicate deciding whether a special handler takes a message.
pub type SpecialCheck = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Route {
    Command(Arc<CommandSpec>),
    /// Handed to a waiting interceptor.
    Intercepted,
    /// Event name of the special handler to dispatch.
    Special(String),
    Unhandled,
    Empty,
}

struct Interceptor {
    id: Uuid,
    check: SpecialCheck,
    tx: oneshot::Sender<Message>,
}

#[derive(Default)]
pub struct Router {
    commands: RwLock<BTreeMap<String, Arc<CommandSpec>>>,
    specials: RwLock<Vec<(String, SpecialCheck)>>,
    interceptors: Arc<Mutex<Vec<Interceptor>>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("commands", &self.command_names())
            .field("specials", &self.special_events())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Returns false if the name was already taken, in
    /// which case the new spec replaces the old one.
    pub fn add_command(&self, spec: CommandSpec) -> bool {
        let name = spec.name.to_lowercase();
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(spec))
            .is_none()
    }

    pub fn command(&self, name: &str) -> Option<Arc<CommandSpec>> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Register a special handler. Returns false if `event` is taken.
    pub fn add_special(&self, event: impl Into<String>, check: SpecialCheck) -> bool {
        let event = event.into();
        let mut specials = self.specials.write().unwrap_or_else(PoisonError::into_inner);
        if specials.iter().any(|(existing, _)| *existing == event) {
            return false;
        }
        specials.push((event, check));
        true
    }

    pub fn special_events(&self) -> Vec<String> {
        self.specials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Take the next non-command message accepted by `check`, ahead of
    /// special handlers. The interceptor is removed when it fires or when
    /// the guard is dropped.
    pub fn intercept(&self, check: SpecialCheck) -> (InterceptGuard, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Interceptor { id, check, tx });
        let guard = InterceptGuard {
            id,
            interceptors: Arc::downgrade(&self.interceptors),
        };
        (guard, rx)
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn route(&self, message: &Message) -> Route {
        let Some(first) = message.content.split_whitespace().next() else {
            return Route::Empty;
        };
        if let Some(spec) = self.command(&first.to_lowercase()) {
            return Route::Command(spec);
        }

        {
            let mut interceptors = self.interceptors.lock().unwrap_or_else(PoisonError::into_inner);
            // Receivers that went away no longer get a say.
            interceptors.retain(|i| !i.tx.is_closed());
            if let Some(index) = interceptors.iter().position(|i| run_check(&i.check, message)) {
                let interceptor = interceptors.remove(index);
                debug!(interceptor = %interceptor.id, "message intercepted");
                if interceptor.tx.send(message.clone()).is_ok() {
                    return Route::Intercepted;
                }
            }
        }

        let specials = self.specials.read().unwrap_or_else(PoisonError::into_inner);
        specials
            .iter()
            .find(|(_, check)| run_check(check, message))
            .map_or(Route::Unhandled, |(event, _)| Route::Special(event.clone()))
    }
}

fn run_check(check: &SpecialCheck, message: &Message) -> bool {
    std::panic::catch_unwind(AssertUnwindSafe(|| check(message))).unwrap_or_else(|_| {
        error!(message = %message.id, "message check panicked");
        false
    })
}

/// Removes its interceptor on drop.
#[derive(Debug)]
pub struct InterceptGuard {
    id: Uuid,
    interceptors: std::sync::Weak<Mutex<Vec<Interceptor>>>,
}

impl Drop for InterceptGuard {
    fn drop(&mut self) {
        if let Some(interceptors) = self.interceptors.upgrade() {
            interceptors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|i| i.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Arg;
    use crate::platform::Author;

    fn message(content: &str) -> Message {
        Message::new("general", Author::new("u1", "alice"), content)
    }

    fn command(name: &str, delimiter: Option<&str>) -> CommandSpec {
        CommandSpec {
            name: name.to_string(),
            help: None,
            argspec: Argspec::new(name, vec![Arg::string("rest").remainder()]),
            delimiter: delimiter.map(str::to_string),
        }
    }

    #[test]
    fn test_split_args() {
        let spec = command("!poll", Some("|"));
        assert_eq!(
            spec.split_args("!poll  Lunch? | pizza | tacos ", false),
            vec!["Lunch?", "pizza", "tacos"]
        );
        assert_eq!(
            spec.split_args("!poll Lunch? | pizza", true),
            vec!["Lunch?", "|", "pizza"]
        );
        assert_eq!(spec.split_args("!poll a b", false), vec!["a", "b"]);
        assert!(spec.split_args("!poll", false).is_empty());
    }

    #[test]
    fn test_routing_precedence() {
        let router = Router::new();
        assert!(router.add_command(command("!ping", None)));
        assert!(router.add_special("special:echo", Arc::new(|_m: &Message| true)));
        assert!(!router.add_special("special:echo", Arc::new(|_m: &Message| true)));

        assert!(matches!(router.route(&message("!PING now")), Route::Command(spec) if spec.name == "!ping"));
        assert!(matches!(router.route(&message("   ")), Route::Empty));
        assert!(matches!(router.route(&message("hello")), Route::Special(e) if e == "special:echo"));

        let (_guard, mut rx) = router.intercept(Arc::new(|m: &Message| m.content == "yes"));
        assert!(matches!(router.route(&message("no")), Route::Special(_)));
        assert!(matches!(router.route(&message("!ping")), Route::Command(_)));
        assert!(matches!(router.route(&message("yes")), Route::Intercepted));
        assert_eq!(rx.try_recv().unwrap().content, "yes");
        // One message per interceptor.
        assert!(matches!(router.route(&message("yes")), Route::Special(_)));
    }

    #[test]
    fn test_guard_removes_interceptor() {
        let router = Router::new();
        let (guard, _rx) = router.intercept(Arc::new(|_m: &Message| true));
        assert_eq!(router.interceptor_count(), 1);
        drop(guard);
        assert_eq!(router.interceptor_count(), 0);
        assert!(matches!(router.route(&message("anything")), Route::Unhandled));
    }

    #[test]
    fn test_panicking_check_is_skipped() {
        let router = Router::new();
        router.add_special("special:boom", Arc::new(|_m: &Message| -> bool { panic!("boom") }));
        router.add_special("special:ok", Arc::new(|_m: &Message| true));
        assert!(matches!(router.route(&message("hi")), Route::Special(e) if e == "special:ok"));
    }
}
