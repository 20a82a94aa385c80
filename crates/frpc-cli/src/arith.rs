//! Demo `Arith` service served by `frpc serve`.

use frpc::{RegistryError, Service};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ArithError {
    #[error("divide by zero")]
    DivideByZero,
    #[error("overflow")]
    Overflow,
}

pub struct Arith;

impl Arith {
    fn sum(&self, args: Args, reply: &mut i64) -> Result<(), ArithError> {
        *reply = args.a.checked_add(args.b).ok_or(ArithError::Overflow)?;
        Ok(())
    }

    fn mul(&self, args: Args, reply: &mut i64) -> Result<(), ArithError> {
        *reply = args.a.checked_mul(args.b).ok_or(ArithError::Overflow)?;
        Ok(())
    }

    fn div(&self, args: Args, reply: &mut i64) -> Result<(), ArithError> {
        if args.b == 0 {
            return Err(ArithError::DivideByZero);
        }
        *reply = args.a.checked_div(args.b).ok_or(ArithError::Overflow)?;
        Ok(())
    }

    /// Block the handler thread for `ms` milliseconds and echo it back.
    fn sleep(&self, ms: u64, reply: &mut u64) -> Result<(), ArithError> {
        std::thread::sleep(Duration::from_millis(ms));
        *reply = ms;
        Ok(())
    }
}

pub fn service() -> Result<Service, RegistryError> {
    Service::builder("Arith", Arith)
        .method("Sum", Arith::sum)
        .method("Mul", Arith::mul)
        .method("Div", Arith::div)
        .method("Sleep", Arith::sleep)
        .build()
}
