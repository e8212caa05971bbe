pub mod lag_calculator;
pub mod scheduler;
