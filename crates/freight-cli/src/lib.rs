pub mod cmd;
pub mod manifest;
pub mod output;
