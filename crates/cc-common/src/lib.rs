pub mod api;
pub mod chart;
pub mod db;
pub mod document;
pub mod logging;
pub mod notify;
pub mod queue;
