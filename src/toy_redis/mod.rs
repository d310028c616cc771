mod commands;
mod error;
mod request;
mod server;
mod store;

pub use server::Server;
pub use store::KeyValueStore;

#[cfg(test)]
mod tests;
