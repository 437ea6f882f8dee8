//! Sample `calculator` interface, served by the binary and used by the
//! integration tests.

use crate::error::CallError;
use crate::remote_interface;

remote_interface! {
    /// Integer arithmetic.
    pub trait Calculator as "calculator" {
        proxy CalculatorProxy;
        service CalculatorService;

        fn plus(a: i64, b: i64) -> i64;
        fn minus(a: i64, b: i64) -> i64;
        fn multi(a: i64, b: i64) -> i64;
        /// Integer division, truncating toward zero.
        fn divide(a: i64, b: i64) -> i64;
    }
}

/// In-process implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCalculator;

fn checked(result: Option<i64>, op: &str, a: i64, b: i64) -> Result<i64, CallError> {
    result.ok_or_else(|| CallError::remote(format!("Overflow: {} {} {}", a, op, b)))
}

impl Calculator for LocalCalculator {
    async fn plus(&self, a: i64, b: i64) -> Result<i64, CallError> {
        checked(a.checked_add(b), "+", a, b)
    }

    async fn minus(&self, a: i64, b: i64) -> Result<i64, CallError> {
        checked(a.checked_sub(b), "-", a, b)
    }

    async fn multi(&self, a: i64, b: i64) -> Result<i64, CallError> {
        checked(a.checked_mul(b), "*", a, b)
    }

    async fn divide(&self, a: i64, b: i64) -> Result<i64, CallError> {
        if b == 0 {
            return Err(CallError::remote("Division by zero"));
        }
        checked(a.checked_div(b), "/", a, b)
    }
}
