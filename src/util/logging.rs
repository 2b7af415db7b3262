use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a plain fmt subscriber. Safe to call from every test; only the
/// first call wins.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false)
            .try_init();
    });
}
