pub mod config;
pub mod hooks;
pub mod lookup;
pub mod migrate;
pub mod runtime;
pub mod search;
pub mod store;
pub mod substitute;

#[cfg(test)]
mod test_support;
