// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-manager configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default usable stack size per fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default number of idle fibers kept for reuse.
pub const DEFAULT_MAX_FIBERS_POOL_SIZE: usize = 1000;

/// Default size of the in-place closure buffer carried by every fiber.
pub const DEFAULT_USER_BUFFER_SIZE: usize = 256;

/// Fiber manager options.
///
/// All fibers of one manager share the same stack size and scratch-buffer
/// size, so any pooled fiber can take any task.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Options {
    /// Stack size in bytes for each fiber. Rounded up by the stack allocator.
    pub stack_size: usize,
    /// Maximum number of finished fibers kept for reuse.
    pub max_fibers_pool_size: usize,
    /// Bytes of in-place storage for task closures. Larger closures are boxed.
    pub user_buffer_size: usize,
}

impl Options {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_fibers_pool_size: DEFAULT_MAX_FIBERS_POOL_SIZE,
            user_buffer_size: DEFAULT_USER_BUFFER_SIZE,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_max_fibers_pool_size(mut self, fibers: usize) -> Self {
        self.max_fibers_pool_size = fibers;
        self
    }

    pub fn with_user_buffer_size(mut self, bytes: usize) -> Self {
        self.user_buffer_size = bytes;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(opts.max_fibers_pool_size, 1000);
        assert_eq!(opts.user_buffer_size, 256);
    }

    #[test]
    fn builder_overrides() {
        let opts = Options::new()
            .with_stack_size(64 * 1024)
            .with_max_fibers_pool_size(8)
            .with_user_buffer_size(0);
        assert_eq!(opts.stack_size, 64 * 1024);
        assert_eq!(opts.max_fibers_pool_size, 8);
        assert_eq!(opts.user_buffer_size, 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_partial() {
        let opts: Options = serde_json::from_str(r#"{"max_fibers_pool_size": 4}"#).unwrap();
        assert_eq!(opts.max_fibers_pool_size, 4);
        assert_eq!(opts.stack_size, DEFAULT_STACK_SIZE);
    }
}
