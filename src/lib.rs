pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod encoding;
pub mod error_handling;
pub mod identifier;
pub mod pubsub;
pub mod storage;
pub mod web_interface;
