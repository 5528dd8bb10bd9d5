//! Transaction construction and submission

pub mod sender;

pub use sender::TransactionSender;
