//! State comparator.
//!
//! Pure function from (desired physical functions, actual device state) to
//! an ordered list of actions. Does no I/O and has no side effects.
//!
//! Ordering:
//! 1. Desired entries in spec order, one action each (`NoOp`, `Create`,
//!    `Update` or `Reject`).
//! 2. Devices that are configured but no longer desired, as `Delete`, and
//!    undesired devices whose state could not be read, as `Reject`, in
//!    ascending PCI address order.

use crds::PhysicalFunctionConfig;
use fec_device_client::DeviceSnapshot;
use std::collections::{BTreeMap, HashSet};

/// One step needed to move a device towards its desired layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    /// Device already matches
    NoOp(PhysicalFunctionConfig),
    /// Device present but unconfigured
    Create(PhysicalFunctionConfig),
    /// Device configured differently
    Update {
        desired: PhysicalFunctionConfig,
        actual: DeviceSnapshot,
    },
    /// Device configured but no longer desired
    Delete(DeviceSnapshot),
    /// Entry cannot be acted upon
    Reject { pci_address: String, reason: String },
}

impl ConfigAction {
    pub fn pci_address(&self) -> &str {
        match self {
            ConfigAction::NoOp(c) | ConfigAction::Create(c) => &c.pci_address,
            ConfigAction::Update { desired, .. } => &desired.pci_address,
            ConfigAction::Delete(s) => &s.pci_address,
            ConfigAction::Reject { pci_address, .. } => pci_address,
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigAction::NoOp(_) => "noop",
            ConfigAction::Create(_) => "create",
            ConfigAction::Update { .. } => "update",
            ConfigAction::Delete(_) => "delete",
            ConfigAction::Reject { .. } => "reject",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ConfigAction::Create(_) | ConfigAction::Update { .. } | ConfigAction::Delete(_)
        )
    }
}

/// Actual state of the devices relevant to one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceActualState {
    /// Devices that exist, keyed by PCI address
    pub devices: BTreeMap<String, DeviceSnapshot>,
    /// Devices whose state could not be read, with the error
    pub unreadable: BTreeMap<String, String>,
}

impl DeviceActualState {
    /// Record a readable device; clears any earlier read error for it
    pub fn insert(&mut self, snapshot: DeviceSnapshot) {
        self.unreadable.remove(&snapshot.pci_address);
        self.devices.insert(snapshot.pci_address.clone(), snapshot);
    }

    /// Record a read error; drops any earlier snapshot of the device
    pub fn mark_unreadable(&mut self, pci_address: &str, error: impl Into<String>) {
        self.devices.remove(pci_address);
        self.unreadable.insert(pci_address.to_string(), error.into());
    }
}

/// Whether a device already carries the desired layout
pub fn matches(desired: &PhysicalFunctionConfig, actual: &DeviceSnapshot) -> bool {
    if desired.vf_amount != actual.vf_amount {
        return false;
    }
    if desired.bitstream != actual.bitstream {
        return false;
    }
    if let Some(pf_driver) = &desired.pf_driver {
        if actual.pf_driver.as_deref() != Some(pf_driver.as_str()) {
            return false;
        }
    }
    // VF driver only matters when there are VFs to bind
    desired.vf_amount == 0 || actual.vf_driver.as_deref() == Some(desired.vf_driver.as_str())
}

/// Compute the actions that move `actual` towards `desired`
pub fn compare(desired: &[PhysicalFunctionConfig], actual: &DeviceActualState) -> Vec<ConfigAction> {
    let mut actions: Vec<ConfigAction> = Vec::with_capacity(desired.len());
    let mut seen: HashSet<&str> = HashSet::new();
    let mut rejected_duplicates: HashSet<&str> = HashSet::new();

    for config in desired {
        let address = if config.pci_address.trim().is_empty() {
            ""
        } else {
            config.pci_address.as_str()
        };

        if !seen.insert(address) {
            // Every occurrence of a duplicated address collapses into one Reject
            if rejected_duplicates.insert(address) {
                actions.retain(|a| a.pci_address() != address);
                let reason = if address.is_empty() {
                    "several physical function entries have an empty PCI address".to_string()
                } else {
                    format!("PCI address {} is declared more than once", address)
                };
                actions.push(ConfigAction::Reject {
                    pci_address: address.to_string(),
                    reason,
                });
            }
            continue;
        }

        if address.is_empty() {
            actions.push(ConfigAction::Reject {
                pci_address: String::new(),
                reason: "physical function entry has an empty PCI address".to_string(),
            });
            continue;
        }

        if let Some(error) = actual.unreadable.get(address) {
            actions.push(ConfigAction::Reject {
                pci_address: address.to_string(),
                reason: format!("device state could not be read: {}", error),
            });
            continue;
        }

        let action = match actual.devices.get(address) {
            // Missing devices are left to the applier, which reports them as failed
            None => ConfigAction::Create(config.clone()),
            Some(snapshot) if matches(config, snapshot) => ConfigAction::NoOp(config.clone()),
            Some(snapshot) if !snapshot.is_configured() => ConfigAction::Create(config.clone()),
            Some(snapshot) => ConfigAction::Update {
                desired: config.clone(),
                actual: snapshot.clone(),
            },
        };
        actions.push(action);
    }

    // Trailing actions in ascending PCI address order
    let mut trailing: Vec<ConfigAction> = Vec::new();
    for (address, snapshot) in &actual.devices {
        if !seen.contains(address.as_str()) && snapshot.is_configured() {
            trailing.push(ConfigAction::Delete(snapshot.clone()));
        }
    }
    for (address, error) in &actual.unreadable {
        if !seen.contains(address.as_str()) {
            trailing.push(ConfigAction::Reject {
                pci_address: address.clone(),
                reason: format!("device state could not be read: {}", error),
            });
        }
    }
    trailing.sort_by(|a, b| a.pci_address().cmp(b.pci_address()));
    actions.extend(trailing);

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{configured_device, pf};
    use proptest::prelude::*;

    fn state(devices: Vec<DeviceSnapshot>) -> DeviceActualState {
        let mut actual = DeviceActualState::default();
        for device in devices {
            actual.insert(device);
        }
        actual
    }

    #[test]
    fn test_create_for_unconfigured_device() {
        let actual = state(vec![DeviceSnapshot::unconfigured("0000:18:00.0")]);

        let actions = compare(&[pf("0000:18:00.0", 2)], &actual);

        assert_eq!(actions, vec![ConfigAction::Create(pf("0000:18:00.0", 2))]);
    }

    #[test]
    fn test_noop_when_matching() {
        let actual = state(vec![configured_device("0000:18:00.0", 2)]);

        let actions = compare(&[pf("0000:18:00.0", 2)], &actual);

        assert_eq!(actions, vec![ConfigAction::NoOp(pf("0000:18:00.0", 2))]);
    }

    #[test]
    fn test_update_when_different() {
        let actual = state(vec![configured_device("0000:18:00.0", 2)]);

        let actions = compare(&[pf("0000:18:00.0", 4)], &actual);

        assert_eq!(
            actions,
            vec![ConfigAction::Update {
                desired: pf("0000:18:00.0", 4),
                actual: configured_device("0000:18:00.0", 2),
            }]
        );
    }

    #[test]
    fn test_update_when_bitstream_differs() {
        let actual = state(vec![configured_device("0000:18:00.0", 2)]);
        let mut desired = pf("0000:18:00.0", 2);
        desired.bitstream = Some("acc100.cfg".to_string());

        let actions = compare(&[desired], &actual);

        assert_eq!(actions[0].kind(), "update");
    }

    #[test]
    fn test_unset_pf_driver_is_ignored() {
        let mut device = configured_device("0000:18:00.0", 2);
        device.pf_driver = Some("igb_uio".to_string());

        let actions = compare(&[pf("0000:18:00.0", 2)], &state(vec![device.clone()]));
        assert_eq!(actions[0].kind(), "noop");

        let mut desired = pf("0000:18:00.0", 2);
        desired.pf_driver = Some("pci-pf-stub".to_string());
        let actions = compare(&[desired], &state(vec![device]));
        assert_eq!(actions[0].kind(), "update");
    }

    #[test]
    fn test_delete_only_configured_devices() {
        let actual = state(vec![
            configured_device("0000:1b:00.0", 2),
            DeviceSnapshot::unconfigured("0000:1c:00.0"),
        ]);

        let actions = compare(&[], &actual);

        assert_eq!(actions, vec![ConfigAction::Delete(configured_device("0000:1b:00.0", 2))]);
    }

    #[test]
    fn test_deletes_follow_desired_in_address_order() {
        let actual = state(vec![
            configured_device("0000:1d:00.0", 1),
            configured_device("0000:1b:00.0", 1),
            DeviceSnapshot::unconfigured("0000:19:00.0"),
            DeviceSnapshot::unconfigured("0000:18:00.0"),
        ]);

        let actions = compare(&[pf("0000:19:00.0", 1), pf("0000:18:00.0", 1)], &actual);

        let order: Vec<(&str, &str)> = actions.iter().map(|a| (a.kind(), a.pci_address())).collect();
        assert_eq!(
            order,
            vec![
                ("create", "0000:19:00.0"),
                ("create", "0000:18:00.0"),
                ("delete", "0000:1b:00.0"),
                ("delete", "0000:1d:00.0"),
            ]
        );
    }

    #[test]
    fn test_missing_device_left_to_applier() {
        let actions = compare(&[pf("0000:18:00.0", 2)], &DeviceActualState::default());

        assert_eq!(actions, vec![ConfigAction::Create(pf("0000:18:00.0", 2))]);
    }

    #[test]
    fn test_unreadable_undesired_device_rejected_last() {
        let mut actual = state(vec![configured_device("0000:1d:00.0", 1)]);
        actual.mark_unreadable("0000:1b:00.0", "permission denied");

        let actions = compare(&[], &actual);

        let order: Vec<(&str, &str)> = actions.iter().map(|a| (a.kind(), a.pci_address())).collect();
        assert_eq!(order, vec![("reject", "0000:1b:00.0"), ("delete", "0000:1d:00.0")]);
    }

    #[test]
    fn test_unreadable_device_rejected() {
        let mut actual = DeviceActualState::default();
        actual.mark_unreadable("0000:18:00.0", "permission denied");

        let actions = compare(&[pf("0000:18:00.0", 2)], &actual);

        match &actions[..] {
            [ConfigAction::Reject { reason, .. }] => assert!(reason.contains("permission denied")),
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_address_rejected_once() {
        let actual = state(vec![
            DeviceSnapshot::unconfigured("0000:18:00.0"),
            DeviceSnapshot::unconfigured("0000:19:00.0"),
        ]);

        let actions = compare(
            &[pf("0000:18:00.0", 2), pf("0000:19:00.0", 1), pf("0000:18:00.0", 4)],
            &actual,
        );

        let order: Vec<(&str, &str)> = actions.iter().map(|a| (a.kind(), a.pci_address())).collect();
        assert_eq!(order, vec![("create", "0000:19:00.0"), ("reject", "0000:18:00.0")]);
    }

    #[test]
    fn test_empty_address_rejected() {
        let actions = compare(&[pf("", 2)], &DeviceActualState::default());

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "reject");
    }

    #[test]
    fn test_unreadable_device_declared_twice_rejected_once() {
        let mut actual = DeviceActualState::default();
        actual.mark_unreadable("0000:18:00.0", "permission denied");

        let actions = compare(&[pf("0000:18:00.0", 2), pf("0000:18:00.0", 4)], &actual);

        match &actions[..] {
            [ConfigAction::Reject { pci_address, reason }] => {
                assert_eq!(pci_address, "0000:18:00.0");
                assert!(reason.contains("declared more than once"));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_several_empty_addresses_rejected_once() {
        let actual = state(vec![DeviceSnapshot::unconfigured("0000:18:00.0")]);

        let actions = compare(&[pf("", 2), pf("0000:18:00.0", 1), pf(" ", 4)], &actual);

        let order: Vec<(&str, &str)> = actions.iter().map(|a| (a.kind(), a.pci_address())).collect();
        assert_eq!(order, vec![("create", "0000:18:00.0"), ("reject", "")]);
    }

    #[test]
    fn test_device_state_keeps_latest_observation() {
        let mut actual = DeviceActualState::default();
        actual.mark_unreadable("0000:18:00.0", "permission denied");
        actual.insert(configured_device("0000:18:00.0", 2));
        assert!(actual.unreadable.is_empty());

        actual.mark_unreadable("0000:18:00.0", "permission denied");
        assert!(actual.devices.is_empty());
        assert_eq!(actual.unreadable.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(compare(&[], &DeviceActualState::default()).is_empty());
    }

    fn arb_address() -> impl Strategy<Value = String> {
        (0x18u8..0x20).prop_map(|bus| format!("0000:{:02x}:00.0", bus))
    }

    fn arb_desired() -> impl Strategy<Value = Vec<PhysicalFunctionConfig>> {
        let address = prop_oneof![4 => arb_address(), 1 => Just(String::new())];
        prop::collection::vec((address, 0u32..4), 0..6)
            .prop_map(|v| v.into_iter().map(|(a, n)| pf(&a, n)).collect())
    }

    fn arb_actual() -> impl Strategy<Value = DeviceActualState> {
        // None marks the device unreadable
        prop::collection::btree_map(arb_address(), prop::option::weighted(0.8, 0u32..4), 0..8).prop_map(|m| {
            let mut actual = DeviceActualState::default();
            for (address, vfs) in m {
                match vfs {
                    Some(vfs) => actual.insert(configured_device(&address, vfs)),
                    None => actual.mark_unreadable(&address, "read error"),
                }
            }
            actual
        })
    }

    proptest! {
        #[test]
        fn prop_one_action_per_address(desired in arb_desired(), actual in arb_actual()) {
            let actions = compare(&desired, &actual);
            let mut addresses: Vec<&str> = actions.iter().map(|a| a.pci_address()).collect();
            let total = addresses.len();
            addresses.sort_unstable();
            addresses.dedup();
            prop_assert_eq!(addresses.len(), total);
        }

        #[test]
        fn prop_deletes_come_last(desired in arb_desired(), actual in arb_actual()) {
            let actions = compare(&desired, &actual);
            let first_delete = actions.iter().position(|a| matches!(a, ConfigAction::Delete(_)));
            if let Some(first) = first_delete {
                let tail_ok = actions[first..]
                    .iter()
                    .all(|a| matches!(a, ConfigAction::Delete(_) | ConfigAction::Reject { .. }));
                prop_assert!(tail_ok);
            }
        }

        #[test]
        fn prop_never_deletes_desired(desired in arb_desired(), actual in arb_actual()) {
            let actions = compare(&desired, &actual);
            for action in &actions {
                if let ConfigAction::Delete(snapshot) = action {
                    prop_assert!(desired.iter().all(|d| d.pci_address != snapshot.pci_address));
                    prop_assert!(snapshot.is_configured());
                }
            }
        }

        #[test]
        fn prop_deterministic(desired in arb_desired(), actual in arb_actual()) {
            prop_assert_eq!(compare(&desired, &actual), compare(&desired, &actual));
        }
    }
}
