use std::sync::Arc;

use crate::{HeapMemory, MetaspaceContext, Settings};

pub type TestContext = MetaspaceContext<HeapMemory, spin::Mutex<()>>;

/// A heap-backed context, panicking on invalid settings.
pub fn test_context(settings: Settings) -> Arc<TestContext> {
    Arc::new(TestContext::new(HeapMemory::new(), settings).unwrap())
}
