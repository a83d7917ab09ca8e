//! Command-name routing for incoming messages.
//!
//! Both sides register handlers by exact, case-sensitive command name. A
//! message with no registered handler goes to the fallback if there is one;
//! otherwise it is reported and dropped.

use std::collections::HashMap;
use std::fmt;

use crate::bridge::protocol::Message;

/// Handler invoked with the receiving side's context and the message.
pub type Handler<C> = Box<dyn Fn(&mut C, &Message) -> anyhow::Result<()> + Send + Sync>;

/// Which route a dispatched message took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handler,
    Fallback,
    Unhandled,
}

pub struct CommandDispatcher<C> {
    handlers: HashMap<String, Handler<C>>,
    fallback: Option<Handler<C>>,
}

impl<C> Default for CommandDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for CommandDispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        f.debug_struct("CommandDispatcher")
            .field("commands", &commands)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<C> CommandDispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    /// Register `handler` for `command`, replacing any previous one.
    pub fn on<F>(mut self, command: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut C, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(command, handler);
        self
    }

    pub fn with_fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set_fallback(handler);
        self
    }

    pub fn register<F>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(&mut C, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let command = command.into();
        if self.handlers.insert(command.clone(), Box::new(handler)).is_some() {
            tracing::debug!(%command, "Replaced command handler");
        }
    }

    pub fn set_fallback<F>(&mut self, handler: F)
    where
        F: Fn(&mut C, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    /// Route `message` to its handler.
    ///
    /// Handler errors are logged, never propagated: one bad command must not
    /// take the channel down.
    pub fn dispatch(&self, ctx: &mut C, message: &Message) -> Dispatched {
        let (route, handler) = match self.handlers.get(&message.command) {
            Some(handler) => (Dispatched::Handler, handler),
            None => match &self.fallback {
                Some(fallback) => (Dispatched::Fallback, fallback),
                None => {
                    tracing::warn!(command = %message.command, "No handler for {}", message.command);
                    return Dispatched::Unhandled;
                }
            },
        };

        if let Err(e) = handler(ctx, message) {
            tracing::error!(command = %message.command, error = %e, "Command handler failed");
        }
        route
    }
}
