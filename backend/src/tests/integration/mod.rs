pub mod enrollment_rules;
pub mod execution_store;
