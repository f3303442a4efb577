//! System call gate
//!
//! Vector 128. The call number arrives in EAX, arguments in EBX through
//! EDI, and the result is written back to EAX. The table itself is
//! populated from outside the core; this module only owns registration and
//! dispatch.

use minos_arch::IrqSpinMutex;

/// Result codes written back to the caller. Negative values are errors.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallCode {
    Success = 0,
    Timeout = -1,
    AlreadyMapped = -2,
    OutOfMemory = -3,
    NoSuchTask = -4,
    Invalid = -5,
}

impl SyscallCode {
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A system call implementation: five raw arguments in, result code or
/// value out.
pub type SyscallHandler = fn(u32, u32, u32, u32, u32) -> i32;

/// Size of the call table.
pub const SYSCALL_COUNT: usize = 64;

static TABLE: IrqSpinMutex<[Option<SyscallHandler>; SYSCALL_COUNT]> =
    IrqSpinMutex::new([None; SYSCALL_COUNT]);

/// Install a handler for call `number`.
///
/// Returns `false` when the number is out of range or already taken.
pub fn register(number: usize, handler: SyscallHandler) -> bool {
    let mut table = TABLE.lock();
    match table.get_mut(number) {
        Some(slot @ None) => {
            *slot = Some(handler);
            true
        }
        _ => false,
    }
}

/// Dispatch a decoded system call.
///
/// Unknown numbers report [`SyscallCode::Invalid`]; user code can pass
/// anything it likes in EAX.
#[must_use]
pub fn dispatch(number: u32, a: u32, b: u32, c: u32, d: u32, e: u32) -> i32 {
    let handler = {
        let table = TABLE.lock();
        table.get(number as usize).copied().flatten()
    };

    match handler {
        Some(handler) => handler(a, b, c, d, e),
        None => {
            log::warn!("syscall: unknown call {}", number);
            SyscallCode::Invalid.as_i32()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_call(a: u32, b: u32, c: u32, _d: u32, _e: u32) -> i32 {
        (a + b + c) as i32
    }

    #[test]
    fn test_register_and_dispatch() {
        assert!(register(40, add_call));
        assert!(!register(40, add_call), "double registration must fail");
        assert_eq!(dispatch(40, 1, 2, 3, 0, 0), 6);
    }

    #[test]
    fn test_unknown_call_is_invalid() {
        assert_eq!(dispatch(63, 0, 0, 0, 0, 0), SyscallCode::Invalid.as_i32());
        assert_eq!(
            dispatch(10_000, 0, 0, 0, 0, 0),
            SyscallCode::Invalid.as_i32()
        );
    }
}
