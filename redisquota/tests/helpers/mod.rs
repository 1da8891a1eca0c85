pub mod tests_engine;
