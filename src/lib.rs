pub mod db;
pub mod environments;
pub mod experiment;
pub mod process;
pub mod settings;
pub mod signals;
pub mod tasks;
