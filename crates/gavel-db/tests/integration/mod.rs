mod common;
mod job_queue_tests;
mod opportunity_tests;
mod snapshot_tests;
