pub mod common;
mod result_tests;
mod task_store_tests;
