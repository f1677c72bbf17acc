pub mod callback;
pub mod database;
pub mod health;
pub mod rbmq;
pub mod smtp;
pub mod template;
