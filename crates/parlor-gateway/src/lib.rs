pub mod connection;
pub mod dispatcher;
pub mod sentiment;

pub use dispatcher::{DispatchError, Dispatcher, Session};
pub use sentiment::SentimentClient;
