pub mod cookie;
pub mod password;
pub mod repo_types;
pub mod services;
pub mod token;
