use crate::Pool;

/// Fluent configuration for a [`Pool`].
///
/// # Example
/// ```
/// let pool = scarlet_executor::Builder::default()
///     .min_kept(2)
///     .name_prefix("blocking")
///     .build();
/// assert_eq!(pool.min_kept(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    pub(crate) min_kept: usize,
    pub(crate) name_prefix: String,
    pub(crate) stack_size: Option<usize>,
}

impl Builder {
    /// Number of idle workers kept alive once they finish their work. Idle
    /// workers beyond this count are torn down.
    pub fn min_kept(mut self, n: usize) -> Self {
        self.min_kept = n;
        self
    }

    /// Prefix of the OS thread names, suffixed with the worker number.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn build(self) -> Pool {
        Pool::new(self)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            min_kept: 4,
            name_prefix: "scarlet-worker".to_string(),
            stack_size: None,
        }
    }
}
