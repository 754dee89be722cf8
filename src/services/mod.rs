pub mod auth_flow;
pub mod browser;
pub mod captcha;
pub mod chat_client;
pub mod dispatcher;

pub use auth_flow::AuthFlow;
pub use captcha::Captcha;
pub use chat_client::{ChatGptClient, Conversation};
pub use dispatcher::{Task, TaskManager};
