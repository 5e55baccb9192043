//! Centralized error handling for Matrix API compliance

pub mod matrix_errors;

pub use matrix_errors::MatrixError;
