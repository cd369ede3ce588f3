// Component discovery
//
// Turns `payload.componentList` into registry records. Feeders and
// dispensers are built first so printers can resolve their linked
// sub-devices by id; every other component is classified by the first
// matching rule in `RULES`, falling back to `DeviceType::Generic`.

use std::collections::HashSet;

use cuss2_api::ComponentId;
use cuss2_api::models::EnvironmentComponent;
use tracing::debug;

use crate::component::{ComponentRecord, DeviceType};

/// Case-insensitive view over a component's characteristic lists.
struct Traits<'a>(&'a EnvironmentComponent);

impl Traits<'_> {
    fn has(list: &[String], value: &str) -> bool {
        list.iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    fn media(&self, value: &str) -> bool {
        self.0
            .component_characteristics
            .iter()
            .any(|c| Self::has(&c.media_types_list, value))
    }

    fn device(&self, value: &str) -> bool {
        self.0
            .component_characteristics
            .iter()
            .any(|c| Self::has(&c.device_types_list, value))
    }

    fn ds(&self, value: &str) -> bool {
        self.0
            .component_characteristics
            .iter()
            .any(|c| Self::has(&c.ds_types_list, value))
    }
}

/// Linked feeder/dispenser ids already present in the first pass.
#[derive(Debug, Default, Clone, Copy)]
struct Links {
    feeder: Option<ComponentId>,
    dispenser: Option<ComponentId>,
}

struct Rule {
    name: &'static str,
    applies: fn(&Traits<'_>) -> bool,
    build: fn(Links) -> DeviceType,
}

const FIRST_PASS: &[Rule] = &[
    Rule {
        name: "feeder",
        applies: |t| t.device("FEEDER"),
        build: |_| DeviceType::Feeder,
    },
    Rule {
        name: "dispenser",
        applies: |t| t.device("DISPENSER"),
        build: |_| DeviceType::Dispenser,
    },
];

const RULES: &[Rule] = &[
    Rule {
        name: "bag tag printer",
        applies: |t| t.media("BaggageTag") && t.device("PRINT"),
        build: |l| DeviceType::BagTagPrinter {
            feeder: l.feeder,
            dispenser: l.dispenser,
        },
    },
    Rule {
        name: "boarding pass printer",
        applies: |t| t.media("BoardingPass") && t.device("PRINT"),
        build: |l| DeviceType::BoardingPassPrinter {
            feeder: l.feeder,
            dispenser: l.dispenser,
        },
    },
    Rule {
        name: "document reader",
        applies: |t| t.ds("DS_TYPES_ISO") || t.media("Passport"),
        build: |_| DeviceType::DocumentReader,
    },
    Rule {
        name: "barcode reader",
        applies: |t| t.ds("DS_TYPES_BARCODE"),
        build: |_| DeviceType::BarcodeReader,
    },
    Rule {
        name: "card reader",
        applies: |t| t.media("MagneticStripe"),
        build: |_| DeviceType::CardReader,
    },
    Rule {
        name: "keypad",
        applies: |t| t.device("ASSISTIVE") && t.ds("DS_TYPES_KEY"),
        build: |_| DeviceType::Keypad,
    },
    Rule {
        name: "headset",
        applies: |t| t.device("ASSISTIVE") && t.media("Audio"),
        build: |_| DeviceType::Headset,
    },
    Rule {
        name: "scale",
        applies: |t| t.device("SCALE") || t.ds("DS_TYPES_SCALE"),
        build: |_| DeviceType::Scale,
    },
    Rule {
        name: "camera",
        applies: |t| t.device("CAMERA"),
        build: |_| DeviceType::Camera,
    },
    Rule {
        name: "insertion belt",
        applies: |t| t.device("CONVEYOR") && t.device("INSERTION"),
        build: |_| DeviceType::InsertionBelt,
    },
    Rule {
        name: "verification belt",
        applies: |t| t.device("CONVEYOR") && t.device("VERIFICATION"),
        build: |_| DeviceType::VerificationBelt,
    },
    Rule {
        name: "parking belt",
        applies: |t| t.device("CONVEYOR") && t.device("PARKING"),
        build: |_| DeviceType::ParkingBelt,
    },
    Rule {
        name: "rfid",
        applies: |t| t.ds("DS_TYPES_RFID"),
        build: |_| DeviceType::Rfid,
    },
    Rule {
        name: "illumination",
        applies: |t| t.device("ILLUMINATION"),
        build: |_| DeviceType::Illumination,
    },
    Rule {
        name: "announcement",
        applies: |t| t.device("ANNOUNCEMENT"),
        build: |_| DeviceType::Announcement,
    },
];

fn matching<'r>(rules: &'r [Rule], traits: &Traits<'_>) -> Option<&'r Rule> {
    rules.iter().find(|rule| (rule.applies)(traits))
}

fn record(component: &EnvironmentComponent, device_type: DeviceType) -> ComponentRecord {
    let mut record = ComponentRecord::new(component.component_id, device_type);
    record.description.clone_from(&component.component_description);
    record
}

/// Build one record per listed component.
pub fn discover(components: &[EnvironmentComponent]) -> Vec<ComponentRecord> {
    let mut records = Vec::with_capacity(components.len());
    let mut feeders = HashSet::new();
    let mut dispensers = HashSet::new();

    for component in components {
        let Some(rule) = matching(FIRST_PASS, &Traits(component)) else {
            continue;
        };
        let device_type = (rule.build)(Links::default());
        match device_type {
            DeviceType::Feeder => feeders.insert(component.component_id),
            _ => dispensers.insert(component.component_id),
        };
        debug!(component_id = component.component_id, kind = rule.name, "discovered");
        records.push(record(component, device_type));
    }

    for component in components {
        let id = component.component_id;
        if feeders.contains(&id) || dispensers.contains(&id) {
            continue;
        }

        let links = Links {
            feeder: component
                .linked_component_ids
                .iter()
                .copied()
                .find(|linked| feeders.contains(linked)),
            dispenser: component
                .linked_component_ids
                .iter()
                .copied()
                .find(|linked| dispensers.contains(linked)),
        };

        let (kind, device_type) = match matching(RULES, &Traits(component)) {
            Some(rule) => (rule.name, (rule.build)(links)),
            None => ("generic", DeviceType::Generic),
        };
        debug!(component_id = id, kind, "discovered");
        records.push(record(component, device_type));
    }

    records
}
