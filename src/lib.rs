pub mod config;
pub mod guard;
pub mod history;
pub mod logging;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod relay;
