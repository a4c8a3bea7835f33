pub mod chatstore;
