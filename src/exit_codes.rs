//! Exit code constants for the sdlock CLI.
//!
//! - 0: Success
//! - 1: User error (bad args, unknown device)
//! - 2: Configuration error
//! - 3: Fatal lock protocol error

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// User error: bad arguments or unknown device.
pub const USER_ERROR: i32 = 1;

/// Configuration could not be loaded or validated.
pub const CONFIG_ERROR: i32 = 2;

/// A device lock was poisoned by a protocol violation.
pub const FATAL_LOCK_ERROR: i32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [SUCCESS, USER_ERROR, CONFIG_ERROR, FATAL_LOCK_ERROR];
        for (i, &a) in codes.iter().enumerate() {
            for (j, &b) in codes.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "Exit codes must be distinct");
                }
            }
        }
    }
}
