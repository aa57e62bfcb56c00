//! Battery cluster (register layout version B)
//!
//! A master unit in front of up to five racks. Racks not listed in the
//! device configuration are driven UNUSED on start; their contactors are
//! polled at LOW priority and only taken into account when they answer.

use super::model::{any_set, bit_table, limit_pair, BatteryModel};
use super::single_rack::{
    CHARGE_INDICATION_OPTIONS, CONTACTOR_CUT_OFF, CONTACTOR_ON_GRID, CONTACTOR_OPTIONS,
};
use super::state_machine::{Command, ContactorPattern, Observation};
use crate::core::channel::{
    AccessMode, ChannelDoc, ChannelId, ChannelStore, ChannelType, EnumOptions, Value,
};
use crate::core::config::MAX_RACKS;
use crate::error::Result;
use crate::protocols::modbus::codec::RegisterElement;
use crate::protocols::modbus::task::{Priority, Task};

const START_STOP_OPTIONS: EnumOptions = &[(0, "STOP"), (1, "START")];
const RACK_USAGE_OPTIONS: EnumOptions = &[(0, "UNUSED"), (1, "USED")];

const START: i64 = 1;
const STOP: i64 = 0;
const USED: i64 = 1;
const UNUSED: i64 = 0;

const RACK_ADDRESS_OFFSETS: [u16; MAX_RACKS as usize] = [0x2000, 0x3000, 0x4000, 0x5000, 0x6000];
const OFFSET_RESET: u16 = 0x04;
const OFFSET_CONTACTOR_CONTROL: u16 = 0x10;
const OFFSET_SLEEP: u16 = 0x1D;

/// Master alarms (0x1081) and whether they are a fault
const MASTER_ALARMS: &[(u8, &str, bool)] = &[
    (4, "MASTER_ALARM_LEVEL_2_INSULATION", true),
    (3, "MASTER_ALARM_LEVEL_1_INSULATION", false),
    (2, "MASTER_ALARM_PCS_EMS_CONTROL_FAIL", true),
    (1, "MASTER_ALARM_PCS_EMS_COMMUNICATION_FAILURE", true),
    (0, "MASTER_ALARM_COMMUNICATION_ERROR_WITH_SUBMASTER", true),
];

/// Bits of the per rack alarm words (0x1083 + rack - 1), in `RackNames::alarms` order
const RACK_ALARM_BITS: [u8; 6] = [5, 4, 3, 2, 1, 0];

/// Channel names are static; racks are numbered 1..=5
const RACK_NAMES: [RackNames; MAX_RACKS as usize] = [
    RackNames::new(1),
    RackNames::new(2),
    RackNames::new(3),
    RackNames::new(4),
    RackNames::new(5),
];

struct RackNames {
    usage: &'static str,
    contactor: &'static str,
    reset: &'static str,
    sleep: &'static str,
    sub_master_failure: &'static str,
    alarms: [&'static str; 6],
}

macro_rules! rack_names {
    ($n:literal) => {
        RackNames {
            usage: concat!("RACK_", $n, "_USAGE"),
            contactor: concat!("RACK_", $n, "_BMS_CONTACTOR_CONTROL"),
            reset: concat!("RACK_", $n, "_RESET"),
            sleep: concat!("RACK_", $n, "_SLEEP"),
            sub_master_failure: concat!("SUB_MASTER_", $n, "_COMMUNICATION_FAILURE"),
            alarms: [
                concat!("RACK_", $n, "_LEVEL_2_ALARM"),
                concat!("RACK_", $n, "_PCS_CONTROL_FAULT"),
                concat!("RACK_", $n, "_COMMUNICATION_WITH_MASTER_ERROR"),
                concat!("RACK_", $n, "_DEVICE_ERROR"),
                concat!("RACK_", $n, "_CYCLE_OVER_CURRENT"),
                concat!("RACK_", $n, "_VOLTAGE_DIFFERENCE"),
            ],
        }
    };
}

impl RackNames {
    const fn new(rack: u8) -> Self {
        match rack {
            1 => rack_names!("1"),
            2 => rack_names!("2"),
            3 => rack_names!("3"),
            4 => rack_names!("4"),
            _ => rack_names!("5"),
        }
    }
}

#[derive(Debug)]
struct Rack {
    number: u8,
    in_use: bool,
    usage: ChannelId,
    contactor: ChannelId,
    /// Reset and sleep are only declared for racks in use
    reset: Option<ChannelId>,
    sleep: Option<ChannelId>,
}

#[derive(Debug)]
pub struct Cluster {
    start_stop: ChannelId,
    master_reset: ChannelId,
    racks: Vec<Rack>,
    faults: Vec<ChannelId>,
    charge_limit: ChannelId,
    discharge_limit: ChannelId,
}

impl Cluster {
    /// Declare channels and tasks in `store` for the racks in `in_use`
    pub fn build(store: &mut ChannelStore, in_use: &[u8]) -> Result<(Self, Vec<Task>)> {
        use ChannelType::{Boolean, Decimal, Enum, Integer};

        let start_stop = store.add(ChannelDoc::new(
            "CLUSTER_START_STOP",
            Enum(START_STOP_OPTIONS),
            AccessMode::ReadWrite,
        ))?;
        let master_reset = store.add(ChannelDoc::new("RESET", Integer, AccessMode::Write))?;

        let mut tasks = vec![Task::write_multiple(
            0x1004,
            Priority::High,
            vec![RegisterElement::unsigned_word(0x1004).map(master_reset)],
        )];

        // Start/stop and rack usage
        let mut usage_block = vec![RegisterElement::unsigned_word(0x1017).map(start_stop)];
        let mut racks = Vec::with_capacity(RACK_NAMES.len());
        for (index, names) in RACK_NAMES.iter().enumerate() {
            let number = index as u8 + 1;
            let usage = store.add(ChannelDoc::new(
                names.usage,
                Enum(RACK_USAGE_OPTIONS),
                AccessMode::ReadWrite,
            ))?;
            usage_block.push(RegisterElement::unsigned_word(0x1018 + index as u16).map(usage));

            let contactor = store.add(ChannelDoc::read(names.contactor, Enum(CONTACTOR_OPTIONS)))?;
            let in_use = in_use.contains(&number);
            racks.push(Rack {
                number,
                in_use,
                usage,
                contactor,
                reset: None,
                sleep: None,
            });
        }
        tasks.push(Task::write_multiple(0x1017, Priority::High, usage_block.clone()));
        tasks.push(Task::read(0x1017, Priority::High, usage_block));

        // Summary
        let charge_indication =
            store.add(ChannelDoc::read("CHARGE_INDICATION", Enum(CHARGE_INDICATION_OPTIONS)))?;
        let current = store.add(ChannelDoc::read("CURRENT", Decimal).with_unit("A"))?;
        let soc = store.add(ChannelDoc::read("SOC", Integer).with_unit("%"))?;
        let running_state = store.add(ChannelDoc::read("SYSTEM_RUNNING_STATE", Integer))?;
        let voltage = store.add(ChannelDoc::read("VOLTAGE", Decimal).with_unit("V"))?;
        tasks.push(Task::read(
            0x1044,
            Priority::Low,
            vec![
                RegisterElement::unsigned_word(0x1044).map(charge_indication),
                RegisterElement::signed_word(0x1045).map(current).scale(-1),
                RegisterElement::dummy(0x1046, 0x1046),
                RegisterElement::unsigned_word(0x1047).map(soc),
                RegisterElement::unsigned_word(0x1048).map(running_state),
                RegisterElement::unsigned_word(0x1049).map(voltage).scale(-1),
            ],
        ));

        let insulation = store.add(ChannelDoc::read("SYSTEM_INSULATION", Integer).with_unit("kΩ"))?;
        let charge_limit =
            store.add(ChannelDoc::read("BMS_CHARGE_MAX_CURRENT", Decimal).with_unit("A"))?;
        let discharge_limit =
            store.add(ChannelDoc::read("BMS_DISCHARGE_MAX_CURRENT", Decimal).with_unit("A"))?;
        tasks.push(Task::read(
            0x104A,
            Priority::High,
            vec![
                RegisterElement::unsigned_word(0x104A).map(insulation),
                RegisterElement::dummy(0x104B, 0x104D),
                RegisterElement::unsigned_word(0x104E).map(charge_limit).scale(-1),
                RegisterElement::unsigned_word(0x104F).map(discharge_limit).scale(-1),
            ],
        ));

        // Alarms
        let mut faults = Vec::new();
        let mut master = RegisterElement::bits(0x1081);
        for &(bit, name, fault) in MASTER_ALARMS {
            let id = store.add(ChannelDoc::read(name, Boolean))?;
            master = master.bit(bit, id);
            if fault {
                faults.push(id);
            }
        }
        let mut sub_master = RegisterElement::bits(0x1082);
        for rack in racks.iter().filter(|r| r.in_use) {
            let name = RACK_NAMES[usize::from(rack.number - 1)].sub_master_failure;
            let id = store.add(ChannelDoc::read(name, Boolean))?;
            sub_master = sub_master.bit(rack.number - 1, id);
            faults.push(id);
        }
        let mut alarm_block = vec![master, sub_master];
        for (index, names) in RACK_NAMES.iter().enumerate() {
            let table: Vec<(u8, &'static str)> = RACK_ALARM_BITS.into_iter().zip(names.alarms).collect();
            let (element, _) = bit_table(store, RegisterElement::bits(0x1083 + index as u16), &table)?;
            alarm_block.push(element);
        }
        tasks.push(Task::read(0x1081, Priority::Low, alarm_block));

        // Per rack registers
        for rack in &mut racks {
            let names = &RACK_NAMES[usize::from(rack.number - 1)];
            let offset = RACK_ADDRESS_OFFSETS[usize::from(rack.number - 1)];
            let priority = if rack.in_use {
                Priority::High
            } else {
                Priority::Low
            };
            tasks.push(Task::read(
                offset + OFFSET_CONTACTOR_CONTROL,
                priority,
                vec![RegisterElement::unsigned_word(offset + OFFSET_CONTACTOR_CONTROL).map(rack.contactor)],
            ));

            if rack.in_use {
                let reset = store.add(ChannelDoc::new(names.reset, Integer, AccessMode::Write))?;
                let sleep = store.add(ChannelDoc::new(names.sleep, Integer, AccessMode::Write))?;
                tasks.push(Task::write_multiple(
                    offset + OFFSET_RESET,
                    Priority::High,
                    vec![RegisterElement::unsigned_word(offset + OFFSET_RESET).map(reset)],
                ));
                tasks.push(Task::write_multiple(
                    offset + OFFSET_SLEEP,
                    Priority::High,
                    vec![RegisterElement::unsigned_word(offset + OFFSET_SLEEP).map(sleep)],
                ));
                rack.reset = Some(reset);
                rack.sleep = Some(sleep);
            }
        }

        Ok((
            Self {
                start_stop,
                master_reset,
                racks,
                faults,
                charge_limit,
                discharge_limit,
            },
            tasks,
        ))
    }

    fn contactor_pattern(&self, store: &ChannelStore) -> ContactorPattern {
        let mut used_on = true;
        let mut used_off = true;
        let mut others_off = true;

        for rack in &self.racks {
            let value = store.int_value(rack.contactor);
            if rack.in_use {
                match value {
                    Some(v) => {
                        used_on &= v == CONTACTOR_ON_GRID;
                        used_off &= v == CONTACTOR_CUT_OFF;
                    },
                    None => return ContactorPattern::Unknown,
                }
            } else if let Some(v) = value {
                // Absent racks do not answer; only a reading counts
                others_off &= v == CONTACTOR_CUT_OFF;
            }
        }

        match (used_off, used_on, others_off) {
            (true, _, true) => ContactorPattern::Stopped,
            (_, true, true) => ContactorPattern::Running,
            _ => ContactorPattern::Ambiguous,
        }
    }
}

impl BatteryModel for Cluster {
    fn family(&self) -> &'static str {
        "cluster"
    }

    fn observe(&self, store: &ChannelStore) -> Observation {
        Observation::new(any_set(store, &self.faults), self.contactor_pattern(store))
    }

    fn command(&self, command: Command, store: &mut ChannelStore) -> Result<()> {
        match command {
            Command::Start => {
                store.set_next_write(self.start_stop, Value::Int(START))?;
                for rack in &self.racks {
                    let usage = if rack.in_use { USED } else { UNUSED };
                    store.set_next_write(rack.usage, Value::Int(usage))?;
                }
            },
            Command::Stop => {
                store.set_next_write(self.start_stop, Value::Int(STOP))?;
                for rack in &self.racks {
                    store.set_next_write(rack.usage, Value::Int(UNUSED))?;
                }
            },
            Command::Sleep => {
                for sleep in self.racks.iter().filter_map(|r| r.sleep) {
                    store.set_next_write(sleep, Value::Int(1))?;
                }
            },
            Command::Reset => {
                store.set_next_write(self.master_reset, Value::Int(1))?;
                for reset in self.racks.iter().filter_map(|r| r.reset) {
                    store.set_next_write(reset, Value::Int(1))?;
                }
            },
        }
        Ok(())
    }

    fn withdraw(&self, store: &mut ChannelStore) {
        store.clear_pending(self.start_stop);
        for rack in &self.racks {
            store.clear_pending(rack.usage);
        }
    }

    fn bms_limits(&self, store: &ChannelStore) -> Option<(f64, f64)> {
        limit_pair(store, self.charge_limit, self.discharge_limit)
    }

    fn supports_reset(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::channel::Decoded;
    use crate::protocols::modbus::pdu::ModbusPdu;

    fn built(in_use: &[u8]) -> (Cluster, Vec<Task>, ChannelStore) {
        let mut store = ChannelStore::new();
        let (cluster, tasks) = Cluster::build(&mut store, in_use).unwrap();
        for task in &tasks {
            task.validate(&store).unwrap();
            task.bind(&mut store).unwrap();
        }
        (cluster, tasks, store)
    }

    fn set_contactors(cluster: &Cluster, store: &mut ChannelStore, values: &[Option<i64>]) {
        for (rack, value) in cluster.racks.iter().zip(values) {
            match value {
                Some(v) => store.apply(&[Decoded::Value(rack.contactor, Value::Int(*v))]),
                None => store.invalidate(rack.contactor),
            }
        }
    }

    const OFF: Option<i64> = Some(CONTACTOR_CUT_OFF);
    const ON: Option<i64> = Some(CONTACTOR_ON_GRID);

    #[test]
    fn test_running_needs_every_used_rack_on_grid() {
        let (cluster, _, mut store) = built(&[1, 2]);

        set_contactors(&cluster, &mut store, &[ON, ON, OFF, None, None]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Running);

        // One rack in use still open: disagreement is never running
        set_contactors(&cluster, &mut store, &[ON, OFF, OFF, None, None]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Ambiguous);

        // A rack not in use reports closed
        set_contactors(&cluster, &mut store, &[ON, ON, ON, None, None]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Ambiguous);
    }

    #[test]
    fn test_stopped_and_unknown_patterns() {
        let (cluster, _, mut store) = built(&[1, 2]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Unknown);

        set_contactors(&cluster, &mut store, &[OFF, OFF, OFF, OFF, OFF]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Stopped);

        set_contactors(&cluster, &mut store, &[OFF, None, OFF, OFF, OFF]);
        assert_eq!(cluster.observe(&store).pattern, ContactorPattern::Unknown);
    }

    #[test]
    fn test_start_writes_usage_registers() {
        let (cluster, tasks, mut store) = built(&[1, 3]);
        cluster.command(Command::Start, &mut store).unwrap();

        let task = tasks
            .iter()
            .find(|t| t.is_write() && t.start() == 0x1017)
            .unwrap();
        let (runs, rejected) = task.prepare_writes(&store);
        assert!(rejected.is_empty());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start, 0x1017);
        assert_eq!(runs[0].words, vec![1, 1, 0, 1, 0, 0]);

        cluster.command(Command::Stop, &mut store).unwrap();
        let (runs, _) = task.prepare_writes(&store);
        assert_eq!(runs[0].words, vec![0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_sub_master_failure_only_for_racks_in_use() {
        let (cluster, tasks, mut store) = built(&[2]);
        let task = tasks
            .iter()
            .find(|t| !t.is_write() && t.start() == 0x1081)
            .unwrap();
        assert_eq!(task.span(), 7);

        let respond = |words: [u16; 7]| {
            let mut bytes = vec![0x03, 14];
            for w in words {
                bytes.extend_from_slice(&w.to_be_bytes());
            }
            ModbusPdu::from_slice(&bytes).unwrap()
        };

        // Rack 1 failure bit set, rack 1 not in use
        let decoded = task.decode_response(&respond([0, 0b01, 0, 0, 0, 0, 0]), &store).unwrap();
        store.apply(&decoded);
        assert!(!cluster.observe(&store).fault);

        let decoded = task.decode_response(&respond([0, 0b10, 0, 0, 0, 0, 0]), &store).unwrap();
        store.apply(&decoded);
        assert!(cluster.observe(&store).fault);

        // Level 1 insulation and rack alarms are warnings only
        let decoded = task
            .decode_response(&respond([1 << 3, 0, 0x3F, 0x3F, 0, 0, 0]), &store)
            .unwrap();
        store.apply(&decoded);
        assert!(!cluster.observe(&store).fault);
        assert_eq!(
            store.bool_value(store.find("RACK_2_DEVICE_ERROR").unwrap()),
            Some(true)
        );
    }

    #[test]
    fn test_reset_sequence_targets() {
        let (cluster, _, mut store) = built(&[1, 4]);
        assert!(store.find("RACK_2_SLEEP").is_none());

        cluster.command(Command::Sleep, &mut store).unwrap();
        for name in ["RACK_1_SLEEP", "RACK_4_SLEEP"] {
            let id = store.find(name).unwrap();
            assert_eq!(store.get(id).unwrap().next_write(), Some(Value::Int(1)));
        }

        cluster.command(Command::Reset, &mut store).unwrap();
        for name in ["RESET", "RACK_1_RESET", "RACK_4_RESET"] {
            let id = store.find(name).unwrap();
            assert!(store.get(id).unwrap().has_pending_write());
        }
    }
}
