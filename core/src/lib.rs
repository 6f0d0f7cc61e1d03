pub mod db;
pub mod models;
pub mod nightscout;
pub mod service;
