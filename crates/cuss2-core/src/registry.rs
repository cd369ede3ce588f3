// ── Reactive component registry ──
//
// Concurrent storage keyed by component id with push-based change
// notification via a `watch` snapshot. Every mutation that changes a
// record rebuilds the snapshot subscribers receive.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cuss2_api::{ApplicationStateCode, ComponentId, ComponentState, PlatformData};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::component::ComponentRecord;

pub type ComponentSnapshot = Arc<Vec<ComponentRecord>>;

pub(crate) struct ComponentRegistry {
    records: DashMap<ComponentId, ComponentRecord>,
    snapshot: watch::Sender<ComponentSnapshot>,
    discovered: AtomicBool,
}

impl ComponentRegistry {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            records: DashMap::new(),
            snapshot,
            discovered: AtomicBool::new(false),
        }
    }

    /// Replace every record. `required` flags survive for ids that are
    /// listed again.
    pub(crate) fn rebuild(&self, records: Vec<ComponentRecord>) {
        let required: HashMap<ComponentId, bool> = self
            .records
            .iter()
            .map(|r| (r.id, r.required))
            .collect();

        self.records.clear();
        for mut record in records {
            record.required = required.get(&record.id).copied().unwrap_or(false);
            self.records.insert(record.id, record);
        }
        self.discovered.store(true, Ordering::Release);
        self.publish();
    }

    /// Whether discovery has run at least once.
    pub(crate) fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    pub(crate) fn contains(&self, id: ComponentId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn get(&self, id: ComponentId) -> Option<ComponentRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub(crate) fn ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn snapshot(&self) -> ComponentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ComponentSnapshot> {
        self.snapshot.subscribe()
    }

    /// Returns `false` if `id` is unknown.
    pub(crate) fn set_required(&self, id: ComponentId, required: bool) -> bool {
        let changed = match self.records.get_mut(&id) {
            Some(mut record) => {
                let changed = record.required != required;
                record.required = required;
                changed
            }
            None => return false,
        };
        if changed {
            self.publish();
        }
        true
    }

    /// Run the update contract for the addressed component. Returns the
    /// updated record only if something changed.
    pub(crate) fn apply(
        &self,
        id: ComponentId,
        msg: &PlatformData,
        app_state: Option<ApplicationStateCode>,
    ) -> Option<ComponentRecord> {
        let updated = {
            let mut record = self.records.get_mut(&id)?;
            if !record.update_state(msg, app_state) {
                return None;
            }
            record.value().clone()
        };
        self.publish();
        Some(updated)
    }

    /// Record an enable/disable outcome. Returns the record if it changed.
    ///
    /// A component only counts as enabled while the application is ACTIVE
    /// and the component is not UNAVAILABLE.
    pub(crate) fn set_enabled(
        &self,
        id: ComponentId,
        enabled: bool,
        app_state: Option<ApplicationStateCode>,
    ) -> Option<ComponentRecord> {
        let updated = {
            let mut record = self.records.get_mut(&id)?;
            let enabled = enabled
                && app_state == Some(ApplicationStateCode::Active)
                && record.component_state != ComponentState::Unavailable;
            if record.enabled == enabled {
                return None;
            }
            record.enabled = enabled;
            record.value().clone()
        };
        self.publish();
        Some(updated)
    }

    /// Required components that are not ready, sorted by id.
    pub(crate) fn unavailable_required(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.required && !r.ready())
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn enabled_ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Count an in-flight directive until the guard drops.
    pub(crate) fn begin_call(&self, id: ComponentId) -> CallGuard<'_> {
        self.adjust_pending(id, true);
        CallGuard { registry: self, id }
    }

    fn adjust_pending(&self, id: ComponentId, start: bool) {
        let Some(mut record) = self.records.get_mut(&id) else {
            return;
        };
        record.pending_calls = if start {
            record.pending_calls.saturating_add(1)
        } else {
            record.pending_calls.saturating_sub(1)
        };
        drop(record);
        self.publish();
    }

    fn publish(&self) {
        let mut all: Vec<ComponentRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_unstable_by_key(|r| r.id);
        self.snapshot.send_replace(Arc::new(all));
    }
}

pub(crate) struct CallGuard<'a> {
    registry: &'a ComponentRegistry,
    id: ComponentId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.registry.adjust_pending(self.id, false);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::component::DeviceType;

    fn registry_with(ids: &[ComponentId]) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        registry.rebuild(
            ids.iter()
                .map(|&id| ComponentRecord::new(id, DeviceType::Generic))
                .collect(),
        );
        registry
    }

    #[test]
    fn rebuild_keeps_required_flags() {
        let registry = registry_with(&[1, 2]);
        assert!(registry.set_required(1, true));
        assert!(!registry.set_required(42, true));

        registry.rebuild(vec![
            ComponentRecord::new(1, DeviceType::Generic),
            ComponentRecord::new(3, DeviceType::Generic),
        ]);

        assert!(registry.get(1).unwrap().required);
        assert!(registry.get(2).is_none());
        assert_eq!(registry.ids(), vec![1, 3]);
    }

    #[test]
    fn unavailable_required_lists_unready() {
        let registry = registry_with(&[1, 2, 3]);
        registry.set_required(1, true);
        registry.set_required(3, true);

        let ready: PlatformData = serde_json::from_value(json!({
            "meta": { "componentID": 3, "componentState": "READY" }
        }))
        .unwrap();
        let updated = registry
            .apply(3, &ready, Some(ApplicationStateCode::Available))
            .unwrap();
        assert_eq!(updated.component_state, ComponentState::Ready);

        assert_eq!(registry.unavailable_required(), vec![1]);
    }

    #[test]
    fn apply_without_change_does_not_publish() {
        let registry = registry_with(&[1]);
        let rx = registry.subscribe();

        let same: PlatformData = serde_json::from_value(json!({
            "meta": { "componentID": 1, "componentState": "UNAVAILABLE", "platformDirective": "peripherals_send" }
        }))
        .unwrap();
        assert!(registry.apply(1, &same, None).is_none());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn enabled_requires_active_and_available_component() {
        let registry = registry_with(&[1]);

        assert!(
            registry
                .set_enabled(1, true, Some(ApplicationStateCode::Active))
                .is_none()
        );

        let ready: PlatformData = serde_json::from_value(json!({
            "meta": { "componentID": 1, "componentState": "READY" }
        }))
        .unwrap();
        assert!(
            registry
                .apply(1, &ready, Some(ApplicationStateCode::Available))
                .is_some()
        );

        assert!(
            registry
                .set_enabled(1, true, Some(ApplicationStateCode::Available))
                .is_none()
        );
        assert!(!registry.get(1).unwrap().enabled);

        let updated = registry
            .set_enabled(1, true, Some(ApplicationStateCode::Active))
            .unwrap();
        assert!(updated.enabled);
    }

    #[test]
    fn call_guard_tracks_pending() {
        let registry = registry_with(&[5]);
        {
            let _call = registry.begin_call(5);
            assert_eq!(registry.get(5).unwrap().pending_calls, 1);
        }
        assert_eq!(registry.get(5).unwrap().pending_calls, 0);
    }
}
