pub mod account;
pub mod book;
pub mod facade;
pub mod matching;
pub mod replay;
pub mod time;
pub mod types;

pub use account::AccountManager;
pub use facade::VirtualExchange;
pub use matching::MatchingEngine;
pub use time::{ClockMode, TimeManager};
