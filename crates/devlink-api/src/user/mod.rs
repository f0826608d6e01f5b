// User/account service collaborator

mod client;

pub use client::UserClient;
