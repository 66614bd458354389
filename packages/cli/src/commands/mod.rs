pub mod identity;
pub mod login;
pub mod logout;
pub mod register;
pub mod tasks;
