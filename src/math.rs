pub mod decimal;
pub mod factorial;
