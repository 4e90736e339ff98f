//! Packed result codes carried in reply headers.
//!
//! Layout matches the console convention: the low 9 bits hold the
//! module, the next 13 bits the description. `0` is success.

use std::fmt;

pub const MODULE_KERNEL: u32 = 1;
pub const MODULE_SF: u32 = 10;
pub const MODULE_SM: u32 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);

    pub const KERNEL_TIMED_OUT: Self = Self::make(MODULE_KERNEL, 117);
    pub const KERNEL_SESSION_CLOSED: Self = Self::make(MODULE_KERNEL, 123);

    pub const SF_INVALID_IN_HEADER: Self = Self::make(MODULE_SF, 202);
    pub const SF_UNKNOWN_COMMAND_ID: Self = Self::make(MODULE_SF, 221);

    pub const SM_ALREADY_REGISTERED: Self = Self::make(MODULE_SM, 4);
    pub const SM_INVALID_SERVICE_NAME: Self = Self::make(MODULE_SM, 6);
    pub const SM_NOT_REGISTERED: Self = Self::make(MODULE_SM, 7);

    #[inline]
    pub const fn make(module: u32, description: u32) -> Self {
        Self((module & 0x1FF) | ((description & 0x1FFF) << 9))
    }

    #[inline]
    pub const fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    #[inline]
    pub const fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_failure(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ResultCode {
    /// Renders as `2MMM-DDDD`, the form error screens display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:04}", 2000 + self.module(), self.description())
    }
}
