use std::fmt;
use std::sync::Arc;

use crate::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    LinkActivate,
    EditEnter,
    EditExit,
    EditChange,
}

/// Arguments handed to every callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackArgs {
    pub kind: CallbackKind,
    /// Element id of the link or cell record that triggered the call.
    pub element_id: u32,
    /// Link target or edit definition name.
    pub target: String,
    /// Proposed content for edit callbacks; empty for links.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Accept,
    Reject,
}

/// Host scripting runtime that can run a named procedure.
pub trait ScriptBridge: Send + Sync {
    fn call(
        &self,
        document: &mut Document,
        procedure: &str,
        args: &CallbackArgs,
    ) -> Result<CallbackResult, String>;
}

pub type NativeCallback = dyn Fn(&mut Document, &CallbackArgs) -> CallbackResult + Send + Sync;

/// A resolved callback: either a native closure or a procedure in the host script runtime.
#[derive(Clone)]
pub enum Callback {
    Native(Arc<NativeCallback>),
    Script {
        procedure: String,
        bridge: Arc<dyn ScriptBridge>,
    },
}

impl Callback {
    pub fn native(
        f: impl Fn(&mut Document, &CallbackArgs) -> CallbackResult + Send + Sync + 'static,
    ) -> Self {
        Callback::Native(Arc::new(f))
    }

    pub fn script(procedure: impl Into<String>, bridge: Arc<dyn ScriptBridge>) -> Self {
        Callback::Script {
            procedure: procedure.into(),
            bridge,
        }
    }

    pub fn invoke(&self, document: &mut Document, args: &CallbackArgs) -> CallbackResult {
        match self {
            Callback::Native(f) => f(document, args),
            Callback::Script { procedure, bridge } => {
                match bridge.call(document, procedure, args) {
                    Ok(result) => result,
                    Err(message) => {
                        log::warn!("script procedure '{}' failed: {}", procedure, message);
                        CallbackResult::Reject
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Native(_) => f.write_str("Callback::Native"),
            Callback::Script { procedure, .. } => {
                write!(f, "Callback::Script({procedure})")
            }
        }
    }
}
