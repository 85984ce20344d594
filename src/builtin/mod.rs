//! Built-in plugins shipped with chatplug.
//!
//! | factory          | capability        |
//! |------------------|-------------------|
//! | `content-filter` | message processor |
//! | `message-logger` | message processor |
//! | `echo-backend`   | backend           |
//! | `request-tracer` | middleware        |
//! | `usage-tracker`  | extension         |

pub mod content_filter;
pub mod echo_backend;
pub mod message_logger;
pub mod request_tracer;
pub mod usage_tracker;

use std::sync::Arc;

use crate::plugins::{Plugin, PluginLoader};

pub use content_filter::ContentFilter;
pub use echo_backend::EchoBackend;
pub use message_logger::MessageLogger;
pub use request_tracer::RequestTracer;
pub use usage_tracker::UsageTracker;

/// Add every built-in factory to `loader`.
pub fn register_builtins(loader: &mut PluginLoader) {
    loader.register_factory(content_filter::FACTORY, |name: &str| {
        Ok(Arc::new(ContentFilter::new(name)) as Arc<dyn Plugin>)
    });
    loader.register_factory(message_logger::FACTORY, |name: &str| {
        Ok(Arc::new(MessageLogger::new(name)) as Arc<dyn Plugin>)
    });
    loader.register_factory(echo_backend::FACTORY, |name: &str| {
        Ok(Arc::new(EchoBackend::new(name)) as Arc<dyn Plugin>)
    });
    loader.register_factory(request_tracer::FACTORY, |name: &str| {
        Ok(Arc::new(RequestTracer::new(name)) as Arc<dyn Plugin>)
    });
    loader.register_factory(usage_tracker::FACTORY, |name: &str| {
        Ok(Arc::new(UsageTracker::new(name)) as Arc<dyn Plugin>)
    });
}

/// A loader holding only the built-in factories.
pub fn builtin_loader() -> PluginLoader {
    let mut loader = PluginLoader::new();
    register_builtins(&mut loader);
    loader
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Capability, PluginSource};

    #[test]
    fn test_all_builtins_registered() {
        let loader = builtin_loader();
        assert_eq!(
            loader.factory_names(),
            vec![
                "content-filter",
                "echo-backend",
                "message-logger",
                "request-tracer",
                "usage-tracker"
            ]
        );
    }

    #[test]
    fn test_builtins_pass_instance_validation() {
        let loader = builtin_loader();
        let cases = [
            ("content-filter", Capability::MessageProcessor),
            ("message-logger", Capability::MessageProcessor),
            ("echo-backend", Capability::Backend),
            ("request-tracer", Capability::Middleware),
            ("usage-tracker", Capability::Extension),
        ];
        for (factory, capability) in cases {
            let plugin = loader
                .load_from_source(&PluginSource::Factory(factory.to_string()), "instance")
                .unwrap();
            assert_eq!(plugin.metadata().name, "instance");
            assert_eq!(plugin.metadata().category, capability, "{}", factory);
        }
    }
}
