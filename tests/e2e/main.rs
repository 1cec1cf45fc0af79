//! End-to-end tests for EXP.
