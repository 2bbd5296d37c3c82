//! Trellis Action
//!
//! Turns a task element's declarative action payload into a call on an
//! injected handler. The dispatcher owns everything up to the side effect:
//!
//! 1. Look up the handler by the payload's `type` tag
//! 2. Render payload strings as minijinja templates
//! 3. Validate the rendered payload (configuration errors stop here)
//! 4. Execute the handler
//!
//! Transports (mail delivery and the like) live behind the handler traits.

mod dispatcher;
mod email;
mod error;
mod handler;
mod template;

pub use dispatcher::{ActionContext, ActionDispatcher};
pub use email::{EmailAction, EmailSender, LogEmailSender, Recipients, SEND_EMAIL, SendEmailHandler};
pub use error::ActionError;
pub use handler::{ActionHandler, ActionRequest, LogHandler};
pub use template::render_payload;
