pub mod callback;
pub mod email;
pub mod health;
pub mod job;
pub mod notification;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
