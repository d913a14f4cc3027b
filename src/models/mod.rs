pub mod identity;
pub mod job;
pub mod scan_result;
pub mod series;
