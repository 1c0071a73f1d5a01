//! Push capability bound to a resolved base

use std::sync::Arc;

use crate::errors::Result;
use crate::reference::Reference;
use crate::resolver::DockerBase;
use crate::tracker::{Status, StatusTracker};

/// A push handle for a resolved reference
///
/// Construction performs no network I/O. The handle binds the reference's
/// host chain and the resolver's status tracker, which stands in for the
/// upload tracking the registry API does not offer.
pub struct RegistryPusher {
    base: DockerBase,
    object: String,
    tracker: Arc<dyn StatusTracker>,
}

impl RegistryPusher {
    pub(crate) fn new(base: DockerBase, object: String, tracker: Arc<dyn StatusTracker>) -> Self {
        RegistryPusher {
            base,
            object,
            tracker,
        }
    }

    /// The reference this pusher is bound to
    pub fn reference(&self) -> &Reference {
        &self.base.refspec
    }

    /// Tag or digest the push will be committed under
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Looks up the tracked upload status for this pusher's reference
    pub fn status(&self) -> Result<Status> {
        self.tracker.get_status(&self.base.refspec.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RegistryHost;
    use crate::resolver::{Resolver, ResolverOptions};
    use crate::tracker::MemoryTracker;

    #[test]
    fn construction_binds_object_and_tracker() {
        let tracker: Arc<dyn StatusTracker> = Arc::new(MemoryTracker::default());
        let resolver = Resolver::new(ResolverOptions {
            hosts: Some(Arc::new(|_ns: &str| -> Result<Vec<RegistryHost>> {
                Ok(vec![RegistryHost::new("example.com")])
            })),
            tracker: Some(tracker.clone()),
            ..Default::default()
        });

        let pusher = resolver.pusher("example.com/app:v1").unwrap();
        assert_eq!(pusher.object(), "v1");
        assert!(pusher.status().is_err(), "no upload has been tracked yet");

        tracker.set_status(
            "example.com/app:v1",
            Status {
                reference: "example.com/app:v1".to_string(),
                offset: 10,
                total: 100,
            },
        );
        let status = pusher.status().unwrap();
        assert_eq!(status.offset, 10);
        assert_eq!(status.total, 100);
    }
}
