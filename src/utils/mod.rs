pub mod ip;
pub mod logging;
pub mod time;
