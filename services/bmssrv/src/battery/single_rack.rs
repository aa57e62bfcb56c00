//! Single rack battery (register layout version A)

use super::model::{any_set, bit_table, limit_pair, BatteryModel};
use super::state_machine::{Command, ContactorPattern, Observation};
use crate::core::channel::{
    AccessMode, ChannelDoc, ChannelId, ChannelStore, ChannelType, EnumOptions, Value,
};
use crate::error::{BmsError, Result};
use crate::protocols::modbus::codec::RegisterElement;
use crate::protocols::modbus::task::{Priority, Task};

pub const CONTACTOR_CUT_OFF: i64 = 0;
pub const CONTACTOR_CONNECTION_INITIATING: i64 = 1;
pub const CONTACTOR_ON_GRID: i64 = 3;

/// Values written to the contactor control register
const SYSTEM_ON: i64 = 1;
const SYSTEM_OFF: i64 = 0;

pub const CONTACTOR_OPTIONS: EnumOptions = &[
    (CONTACTOR_CUT_OFF, "CUT_OFF"),
    (CONTACTOR_CONNECTION_INITIATING, "CONNECTION_INITIATING"),
    (CONTACTOR_ON_GRID, "ON_GRID"),
];

pub const CHARGE_INDICATION_OPTIONS: EnumOptions =
    &[(0, "STANDING"), (1, "DISCHARGING"), (2, "CHARGING")];

pub const RUN_STATE_OPTIONS: EnumOptions = &[
    (0, "NORMAL"),
    (1, "STOP_CHARGING"),
    (2, "STOP_DISCHARGE"),
    (3, "STANDBY"),
];

/// Level 2 alarms (0x2140); any of them is a fault
const LEVEL2_ALARMS: &[(u8, &str)] = &[
    (0, "ALARM_LEVEL_2_CELL_VOLTAGE_HIGH"),
    (1, "ALARM_LEVEL_2_TOTAL_VOLTAGE_HIGH"),
    (2, "ALARM_LEVEL_2_CHA_CURRENT_HIGH"),
    (3, "ALARM_LEVEL_2_CELL_VOLTAGE_LOW"),
    (4, "ALARM_LEVEL_2_TOTAL_VOLTAGE_LOW"),
    (5, "ALARM_LEVEL_2_DISCHA_CURRENT_HIGH"),
    (6, "ALARM_LEVEL_2_CELL_CHA_TEMP_HIGH"),
    (7, "ALARM_LEVEL_2_CELL_CHA_TEMP_LOW"),
    (12, "ALARM_LEVEL_2_INSULATION_LOW"),
    (14, "ALARM_LEVEL_2_CELL_DISCHA_TEMP_HIGH"),
    (15, "ALARM_LEVEL_2_CELL_DISCHA_TEMP_LOW"),
];

/// Level 1 warnings (0x2141)
const LEVEL1_WARNINGS: &[(u8, &str)] = &[
    (0, "ALARM_LEVEL_1_CELL_VOLTAGE_HIGH"),
    (1, "ALARM_LEVEL_1_TOTAL_VOLTAGE_HIGH"),
    (2, "ALARM_LEVEL_1_CHA_CURRENT_HIGH"),
    (3, "ALARM_LEVEL_1_CELL_VOLTAGE_LOW"),
    (4, "ALARM_LEVEL_1_TOTAL_VOLTAGE_LOW"),
    (5, "ALARM_LEVEL_1_DISCHA_CURRENT_HIGH"),
    (6, "ALARM_LEVEL_1_CELL_CHA_TEMP_HIGH"),
    (7, "ALARM_LEVEL_1_CELL_CHA_TEMP_LOW"),
    (8, "ALARM_LEVEL_1_SOC_LOW"),
    (9, "ALARM_LEVEL_1_CELL_TEMP_DIFF_HIGH"),
    (11, "ALARM_LEVEL_1_CELL_VOLTAGE_DIFF_HIGH"),
    (12, "ALARM_LEVEL_1_INSULATION_LOW"),
    (13, "ALARM_LEVEL_1_TOTAL_VOLTAGE_DIFF_HIGH"),
    (14, "ALARM_LEVEL_1_CELL_DISCHA_TEMP_HIGH"),
    (15, "ALARM_LEVEL_1_CELL_DISCHA_TEMP_LOW"),
];

/// Hardware failures (0x2185)
const FAILURES: &[(u8, &str)] = &[
    (0, "FAILURE_SAMPLING_WIRE"),
    (1, "FAILURE_CONNECTOR_WIRE"),
    (2, "FAILURE_LTC6803"),
    (3, "FAILURE_VOLTAGE_SAMPLING"),
    (4, "FAILURE_TEMP_SAMPLING"),
    (5, "FAILURE_TEMP_SENSOR"),
    (8, "FAILURE_BALANCING_MODULE"),
    (9, "FAILURE_TEMP_SAMPLING_LINE"),
    (10, "FAILURE_INTRANET_COMMUNICATION"),
    (11, "FAILURE_EEPROM"),
    (12, "FAILURE_INITIALIZATION"),
];

fn read(
    store: &mut ChannelStore,
    name: &'static str,
    kind: ChannelType,
    unit: &'static str,
) -> Result<ChannelId> {
    store.add(ChannelDoc::read(name, kind).with_unit(unit))
}

#[derive(Debug)]
pub struct SingleRack {
    contactor: ChannelId,
    faults: Vec<ChannelId>,
    charge_limit: ChannelId,
    discharge_limit: ChannelId,
}

impl SingleRack {
    /// Declare channels and tasks in `store`
    pub fn build(store: &mut ChannelStore) -> Result<(Self, Vec<Task>)> {
        use ChannelType::{Decimal, Enum, Integer};

        let contactor = store.add(ChannelDoc::new(
            "BMS_CONTACTOR_CONTROL",
            Enum(CONTACTOR_OPTIONS),
            AccessMode::ReadWrite,
        ))?;

        let charge_max_voltage = read(store, "CHARGE_MAX_VOLTAGE", Decimal, "V")?;
        let cell_protect = store.add(
            ChannelDoc::new("CELL_VOLTAGE_PROTECT", Integer, AccessMode::ReadWrite).with_unit("mV"),
        )?;
        let cell_recover = store.add(
            ChannelDoc::new("CELL_VOLTAGE_RECOVER", Integer, AccessMode::ReadWrite).with_unit("mV"),
        )?;
        let discharge_min_voltage = read(store, "DISCHARGE_MIN_VOLTAGE", Decimal, "V")?;

        let voltage = read(store, "VOLTAGE", Decimal, "V")?;
        let current = read(store, "CURRENT", Decimal, "A")?;
        let charge_indication =
            store.add(ChannelDoc::read("CHARGE_INDICATION", Enum(CHARGE_INDICATION_OPTIONS)))?;
        let soc = read(store, "SOC", Integer, "%")?;
        let soh = read(store, "SOH", Integer, "%")?;
        let max_cell_voltage_id = store.add(ChannelDoc::read("MAX_CELL_VOLTAGE_ID", Integer))?;
        let max_cell_voltage = read(store, "MAX_CELL_VOLTAGE", Integer, "mV")?;
        let min_cell_voltage_id = store.add(ChannelDoc::read("MIN_CELL_VOLTAGE_ID", Integer))?;
        let min_cell_voltage = read(store, "MIN_CELL_VOLTAGE", Integer, "mV")?;
        let max_temp_id = store.add(ChannelDoc::read("MAX_CELL_TEMPERATURE_ID", Integer))?;
        let max_temp = read(store, "MAX_CELL_TEMPERATURE", Decimal, "°C")?;
        let min_temp_id = store.add(ChannelDoc::read("MIN_CELL_TEMPERATURE_ID", Integer))?;
        let min_temp = read(store, "MIN_CELL_TEMPERATURE", Decimal, "°C")?;
        let insulation = read(store, "SYSTEM_INSULATION", Integer, "kΩ")?;

        let charge_limit = read(store, "BMS_CHARGE_MAX_CURRENT", Decimal, "A")?;
        let discharge_limit = read(store, "BMS_DISCHARGE_MAX_CURRENT", Decimal, "A")?;

        let (level2, faults) = bit_table(store, RegisterElement::bits(0x2140), LEVEL2_ALARMS)?;
        let (level1, _) = bit_table(store, RegisterElement::bits(0x2141), LEVEL1_WARNINGS)?;
        let run_state = store.add(ChannelDoc::read("CLUSTER_RUN_STATE", Enum(RUN_STATE_OPTIONS)))?;
        let (failures, _) = bit_table(store, RegisterElement::bits(0x2185), FAILURES)?;

        let tasks = vec![
            Task::write_single(RegisterElement::unsigned_word(0x2010).map(contactor), Priority::High),
            Task::read(
                0x2010,
                Priority::High,
                vec![RegisterElement::unsigned_word(0x2010).map(contactor)],
            ),
            Task::read(
                0x2042,
                Priority::Low,
                vec![RegisterElement::unsigned_word(0x2042).map(charge_max_voltage).scale(-1)],
            ),
            Task::write_single(RegisterElement::unsigned_word(0x2046).map(cell_protect), Priority::Low),
            Task::write_single(RegisterElement::unsigned_word(0x2047).map(cell_recover), Priority::Low),
            Task::read(
                0x2046,
                Priority::Low,
                vec![
                    RegisterElement::unsigned_word(0x2046).map(cell_protect),
                    RegisterElement::unsigned_word(0x2047).map(cell_recover),
                    RegisterElement::unsigned_word(0x2048).map(discharge_min_voltage).scale(-1),
                ],
            ),
            Task::read(
                0x2100,
                Priority::High,
                vec![
                    RegisterElement::unsigned_word(0x2100).map(voltage).scale(-1),
                    RegisterElement::signed_word(0x2101).map(current).scale(-1),
                    RegisterElement::unsigned_word(0x2102).map(charge_indication),
                    RegisterElement::unsigned_word(0x2103).map(soc),
                    RegisterElement::unsigned_word(0x2104).map(soh),
                    RegisterElement::unsigned_word(0x2105).map(max_cell_voltage_id),
                    RegisterElement::unsigned_word(0x2106).map(max_cell_voltage),
                    RegisterElement::unsigned_word(0x2107).map(min_cell_voltage_id),
                    RegisterElement::unsigned_word(0x2108).map(min_cell_voltage),
                    RegisterElement::unsigned_word(0x2109).map(max_temp_id),
                    RegisterElement::signed_word(0x210A).map(max_temp).scale(-1),
                    RegisterElement::unsigned_word(0x210B).map(min_temp_id),
                    RegisterElement::signed_word(0x210C).map(min_temp).scale(-1),
                    RegisterElement::dummy(0x210D, 0x2115),
                    RegisterElement::unsigned_word(0x2116).map(insulation),
                ],
            ),
            Task::read(
                0x2140,
                Priority::Low,
                vec![
                    level2,
                    level1,
                    RegisterElement::unsigned_word(0x2142).map(run_state),
                ],
            ),
            Task::read(
                0x2160,
                Priority::High,
                vec![
                    RegisterElement::unsigned_word(0x2160).map(charge_limit).scale(-1),
                    RegisterElement::unsigned_word(0x2161).map(discharge_limit).scale(-1),
                ],
            ),
            Task::read(0x2185, Priority::Low, vec![failures]),
        ];

        Ok((
            Self {
                contactor,
                faults,
                charge_limit,
                discharge_limit,
            },
            tasks,
        ))
    }
}

impl BatteryModel for SingleRack {
    fn family(&self) -> &'static str {
        "single_rack"
    }

    fn observe(&self, store: &ChannelStore) -> Observation {
        let pattern = match store.int_value(self.contactor) {
            Some(CONTACTOR_CUT_OFF) => ContactorPattern::Stopped,
            Some(CONTACTOR_ON_GRID) => ContactorPattern::Running,
            Some(_) => ContactorPattern::Ambiguous,
            None => ContactorPattern::Unknown,
        };
        Observation::new(any_set(store, &self.faults), pattern)
    }

    fn command(&self, command: Command, store: &mut ChannelStore) -> Result<()> {
        match command {
            Command::Start => store.set_next_write(self.contactor, Value::Int(SYSTEM_ON)),
            Command::Stop => store.set_next_write(self.contactor, Value::Int(SYSTEM_OFF)),
            Command::Sleep | Command::Reset => Err(BmsError::channel(format!(
                "{:?} is not supported by a single rack",
                command
            ))),
        }
    }

    fn withdraw(&self, store: &mut ChannelStore) {
        store.clear_pending(self.contactor);
    }

    fn bms_limits(&self, store: &ChannelStore) -> Option<(f64, f64)> {
        limit_pair(store, self.charge_limit, self.discharge_limit)
    }
}
