//! State model of a BIT 802E interface card on a BOP supply.
//!
//! [`Device::process`] takes one received line (possibly a `;`-compound of
//! several commands) and returns the reply for any queries in it. List
//! playback is not driven by a timer: the device records when a list was
//! started and derives the running step from the clock when asked.

use crate::faults::Faults;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// `*IDN?` reply.
pub const IDN: &str = "KEPCO,BOP 50-20M,SIM-001,1.5 (Simulator)";

/// `SYST:VERS?` reply.
pub const SCPI_VERSION: &str = "1995.0";

/// List memory per quantity.
pub const MAX_LIST_POINTS: usize = 1002;

/// Shortest accepted dwell, seconds.
pub const LIST_DWELL_MIN: f64 = 0.0005;

/// Longest accepted dwell, seconds.
pub const LIST_DWELL_MAX: f64 = 10.0;

/// Values returned per `LIST:VOLT?`-style read.
const LIST_READ_WINDOW: usize = 16;

/// Output function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Function {
    /// Voltage source.
    #[default]
    Volt,
    /// Current source.
    Curr,
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Function::Volt => "VOLT",
            Function::Curr => "CURR",
        })
    }
}

/// Setpoint source for one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Fixed setpoint.
    #[default]
    Fix,
    /// List playback.
    List,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceMode::Fix => "FIX",
            SourceMode::List => "LIST",
        })
    }
}

/// One entry of the SCPI error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Negative SCPI error code.
    pub code: i32,
    /// Description.
    pub message: String,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},\"{}\"", self.code, self.message)
    }
}

/// Observable device state, for assertions and the dashboard log.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Output relay state.
    pub output_on: bool,
    /// Output function.
    pub function: Function,
    /// Voltage setpoint.
    pub volt_setpoint: f64,
    /// Current setpoint.
    pub curr_setpoint: f64,
    /// Voltage source mode.
    pub volt_mode: SourceMode,
    /// Current source mode.
    pub curr_mode: SourceMode,
    /// Voltage list.
    pub list_volt: Vec<f64>,
    /// Current list.
    pub list_curr: Vec<f64>,
    /// Dwell list, seconds.
    pub list_dwell: Vec<f64>,
    /// Playback repetitions, 0 = indefinite.
    pub list_count: u32,
    /// Whether a list is playing.
    pub list_running: bool,
    /// Pending error queue.
    pub errors: Vec<DeviceError>,
    /// Commands processed.
    pub commands: u64,
    /// Queries answered.
    pub queries: u64,
}

#[derive(Debug)]
struct Playback {
    started: Instant,
    function: Function,
    /// None runs until stopped.
    length: Option<Duration>,
}

/// Simulated device.
#[derive(Debug)]
pub struct Device {
    output_on: bool,
    function: Function,
    volt_setpoint: f64,
    curr_setpoint: f64,
    volt_saved: f64,
    curr_saved: f64,
    volt_range: i64,
    curr_range: i64,
    volt_mode: SourceMode,
    curr_mode: SourceMode,
    list_volt: Vec<f64>,
    list_curr: Vec<f64>,
    list_dwell: Vec<f64>,
    list_count: u32,
    list_query_ptr: usize,
    playback: Option<Playback>,
    esr: u8,
    errors: VecDeque<DeviceError>,
    commands: u64,
    queries: u64,
    point_queries: usize,
    faults: Faults,
}

impl Default for Device {
    fn default() -> Self {
        Self::new(Faults::default())
    }
}

impl Device {
    /// Device at power-on defaults with the given faults armed.
    #[must_use]
    pub fn new(faults: Faults) -> Self {
        Self {
            output_on: false,
            function: Function::Volt,
            volt_setpoint: 0.0,
            curr_setpoint: 0.0,
            volt_saved: 0.0,
            curr_saved: 0.0,
            volt_range: 1,
            curr_range: 1,
            volt_mode: SourceMode::Fix,
            curr_mode: SourceMode::Fix,
            list_volt: Vec::new(),
            list_curr: Vec::new(),
            list_dwell: Vec::new(),
            list_count: 1,
            list_query_ptr: 0,
            playback: None,
            esr: 0,
            errors: VecDeque::new(),
            commands: 0,
            queries: 0,
            point_queries: 0,
            faults,
        }
    }

    /// Armed faults.
    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Armed faults, for re-arming mid-test.
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Restore power-on defaults. Faults stay armed.
    pub fn reset(&mut self) {
        let faults = std::mem::take(&mut self.faults);
        let (commands, queries) = (self.commands, self.queries);
        *self = Self::new(faults);
        self.commands = commands;
        self.queries = queries;
    }

    /// Queue a SCPI error.
    pub fn push_error(&mut self, code: i32, message: impl Into<String>) {
        self.errors.push_back(DeviceError {
            code,
            message: message.into(),
        });
    }

    /// Current observable state.
    pub fn snapshot(&mut self) -> Snapshot {
        self.refresh();
        Snapshot {
            output_on: self.output_on,
            function: self.function,
            volt_setpoint: self.volt_setpoint,
            curr_setpoint: self.curr_setpoint,
            volt_mode: self.volt_mode,
            curr_mode: self.curr_mode,
            list_volt: self.list_volt.clone(),
            list_curr: self.list_curr.clone(),
            list_dwell: self.list_dwell.clone(),
            list_count: self.list_count,
            list_running: self.playback.is_some(),
            errors: self.errors.iter().cloned().collect(),
            commands: self.commands,
            queries: self.queries,
        }
    }

    /// Stop list playback and return both quantities to fixed mode.
    pub fn stop_list(&mut self) {
        if self.playback.take().is_some() {
            tracing::debug!("List playback stopped");
        }
        self.volt_mode = SourceMode::Fix;
        self.curr_mode = SourceMode::Fix;
    }

    /// Process one received line. Returns the `;`-joined replies of any
    /// queries it contained.
    pub fn process(&mut self, line: &str) -> Option<String> {
        self.refresh();
        let replies: Vec<String> = line
            .split(';')
            .map(|seg| seg.trim())
            .map(|seg| seg.strip_prefix(':').unwrap_or(seg))
            .filter(|seg| !seg.is_empty())
            .filter_map(|seg| self.dispatch(seg))
            .collect();
        (!replies.is_empty()).then(|| replies.join(";"))
    }

    fn dispatch(&mut self, cmd: &str) -> Option<String> {
        self.commands += 1;
        let upper = cmd.to_uppercase();

        if let Some(code_msg) = self.faults.take_injected_error(&upper) {
            self.push_error(code_msg.0, code_msg.1);
        }

        let reply = self.execute(cmd, &upper);
        if reply.is_some() {
            self.queries += 1;
            if self.faults.take_dropped_reply(&upper) {
                tracing::debug!(command = %cmd, "Reply dropped by fault");
                return None;
            }
        }
        reply
    }

    fn execute(&mut self, cmd: &str, upper: &str) -> Option<String> {
        match upper {
            // IEEE 488.2 common commands
            "*IDN?" => return Some(IDN.to_string()),
            "*RST" => {
                self.reset();
                return None;
            }
            "*CLS" => {
                self.esr = 0;
                self.errors.clear();
                return None;
            }
            "*ESR?" => return Some(std::mem::take(&mut self.esr).to_string()),
            "*STB?" => {
                let eav = if self.errors.is_empty() { 0 } else { 4 };
                return Some(eav.to_string());
            }
            "*OPC?" => return Some("1".to_string()),
            "*OPC" => {
                self.esr |= 1;
                return None;
            }
            "*WAI" => return None,

            // SYSTem
            "SYST:ERR?" | "SYST:ERR:NEXT?" | "SYSTEM:ERROR?" | "SYSTEM:ERROR:NEXT?" => {
                return Some(self.pop_error());
            }
            "SYST:ERR:ALL?" | "SYSTEM:ERROR:ALL?" => {
                let mut all = Vec::new();
                loop {
                    let next = self.pop_error();
                    let done = next.starts_with('0');
                    all.push(next);
                    if done {
                        break;
                    }
                }
                return Some(all.join(";"));
            }
            "SYST:VERS?" | "SYSTEM:VERSION?" => return Some(SCPI_VERSION.to_string()),

            // OUTPut
            "OUTP ON" | "OUTP 1" | "OUTPUT ON" | "OUTPUT 1" | "OUTP:STAT ON" | "OUTP:STAT 1" => {
                self.output_on = true;
                self.volt_setpoint = self.volt_saved;
                self.curr_setpoint = self.curr_saved;
                return None;
            }
            "OUTP OFF" | "OUTP 0" | "OUTPUT OFF" | "OUTPUT 0" | "OUTP:STAT OFF"
            | "OUTP:STAT 0" => {
                self.volt_saved = self.volt_setpoint;
                self.curr_saved = self.curr_setpoint;
                self.output_on = false;
                self.volt_setpoint = 0.0;
                self.curr_setpoint = 0.0;
                return None;
            }
            "OUTP?" | "OUTPUT?" | "OUTP:STAT?" => return Some(flag(self.output_on)),

            // FUNCtion:MODE
            "FUNC:MODE VOLT" | "FUNCTION:MODE VOLT" => {
                self.set_function(Function::Volt);
                return None;
            }
            "FUNC:MODE CURR" | "FUNCTION:MODE CURR" => {
                self.set_function(Function::Curr);
                return None;
            }
            "FUNC:MODE?" | "FUNCTION:MODE?" => return Some(self.function.to_string()),

            // Setpoint readback and measurement
            "VOLT?" => return Some(scientific(self.volt_setpoint)),
            "CURR?" => return Some(scientific(self.curr_setpoint)),
            "MEAS:VOLT?" | "MEAS:SCAL:VOLT?" | "MEAS:VOLT:DC?" | "MEASURE:VOLTAGE?" => {
                return Some(scientific(self.measure(Function::Volt)));
            }
            "MEAS:CURR?" | "MEAS:SCAL:CURR?" | "MEAS:CURR:DC?" | "MEASURE:CURRENT?" => {
                return Some(scientific(self.measure(Function::Curr)));
            }

            // Source modes
            "VOLT:MODE FIX" | "VOLT:MODE FIXED" | "CURR:MODE FIX" | "CURR:MODE FIXED" => {
                self.stop_list();
                return None;
            }
            "VOLT:MODE LIST" => {
                self.volt_mode = SourceMode::List;
                self.start_list(Function::Volt);
                return None;
            }
            "CURR:MODE LIST" => {
                self.curr_mode = SourceMode::List;
                self.start_list(Function::Curr);
                return None;
            }
            "VOLT:MODE?" => return Some(self.volt_mode.to_string()),
            "CURR:MODE?" => return Some(self.curr_mode.to_string()),
            "VOLT:RANG?" => return Some(self.volt_range.to_string()),
            "CURR:RANG?" => return Some(self.curr_range.to_string()),
            "ABOR" | "ABORT" => {
                self.stop_list();
                return None;
            }

            // LIST
            "LIST:CLE" | "LIST:CLEAR" => {
                self.list_volt.clear();
                self.list_curr.clear();
                self.list_dwell.clear();
                self.list_count = 1;
                self.list_query_ptr = 0;
                return None;
            }
            "LIST:VOLT:POIN?" | "LIST:VOLT:POINTS?" | "LIST:VOLTAGE:POINTS?" => {
                return Some(self.point_count(self.list_volt.len()));
            }
            "LIST:CURR:POIN?" | "LIST:CURR:POINTS?" | "LIST:CURRENT:POINTS?" => {
                return Some(self.point_count(self.list_curr.len()));
            }
            "LIST:DWEL:POIN?" | "LIST:DWELL:POINTS?" => {
                return Some(self.list_dwell.len().to_string());
            }
            "LIST:VOLT?" | "LIST:VOLTAGE?" => return Some(self.read_window(&self.list_volt)),
            "LIST:CURR?" | "LIST:CURRENT?" => return Some(self.read_window(&self.list_curr)),
            "LIST:DWEL?" | "LIST:DWELL?" => return Some(self.read_window(&self.list_dwell)),
            "LIST:COUN?" | "LIST:COUNT?" => return Some(self.list_count.to_string()),
            "LIST:QUER?" | "LIST:QUERY?" => return Some(self.list_query_ptr.to_string()),
            _ => {}
        }

        if let Some(arg) = argument(cmd, upper, "VOLT ") {
            if let Some(v) = parse_float(arg) {
                self.volt_setpoint = v;
                if self.output_on {
                    self.volt_saved = v;
                }
            }
        } else if let Some(arg) = argument(cmd, upper, "CURR ") {
            if let Some(v) = parse_float(arg) {
                self.curr_setpoint = v;
                if self.output_on {
                    self.curr_saved = v;
                }
            }
        } else if let Some(arg) = argument(cmd, upper, "VOLT:RANG ") {
            if let Some(r) = parse_int(arg) {
                self.volt_range = r;
            }
        } else if let Some(arg) = argument(cmd, upper, "CURR:RANG ") {
            if let Some(r) = parse_int(arg) {
                self.curr_range = r;
            }
        } else if let Some(arg) = argument(cmd, upper, "LIST:VOLT ") {
            if !self.list_curr.is_empty() {
                self.push_error(-221, "Settings conflict");
            } else {
                append_capped(&mut self.list_volt, arg);
            }
        } else if let Some(arg) = argument(cmd, upper, "LIST:CURR ") {
            if !self.list_volt.is_empty() {
                self.push_error(-221, "Settings conflict");
            } else {
                append_capped(&mut self.list_curr, arg);
            }
        } else if let Some(arg) = argument(cmd, upper, "LIST:DWEL ") {
            self.append_dwell(arg);
        } else if let Some(arg) = argument(cmd, upper, "LIST:COUN ") {
            if let Some(n) = parse_int(arg) {
                self.list_count = u32::try_from(n.max(0)).unwrap_or(u32::MAX);
            }
        } else if let Some(arg) = argument(cmd, upper, "LIST:QUER ") {
            if let Some(n) = parse_int(arg) {
                self.list_query_ptr = usize::try_from(n.max(0)).unwrap_or(0);
            }
        } else {
            tracing::debug!(command = %cmd, "Unrecognised command");
            self.push_error(-100, format!("Command error; unrecognised: {}", cmd));
        }
        None
    }

    fn pop_error(&mut self) -> String {
        self.errors
            .pop_front()
            .map_or_else(|| "0,\"No error\"".to_string(), |e| e.to_string())
    }

    fn set_function(&mut self, function: Function) {
        self.stop_list();
        self.function = function;
    }

    fn point_count(&mut self, actual: usize) -> String {
        self.point_queries += 1;
        self.faults
            .point_count_reply(self.point_queries, actual)
            .unwrap_or_else(|| actual.to_string())
    }

    fn read_window(&self, list: &[f64]) -> String {
        list.iter()
            .skip(self.list_query_ptr)
            .take(LIST_READ_WINDOW)
            .map(|v| scientific(*v))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn append_dwell(&mut self, arg: &str) {
        let space = MAX_LIST_POINTS.saturating_sub(self.list_dwell.len());
        let values = parse_float_list(arg, space);
        if values
            .iter()
            .any(|v| !(LIST_DWELL_MIN..=LIST_DWELL_MAX).contains(v))
        {
            self.push_error(
                -222,
                format!(
                    "Data out of range; dwell must be {}..{} s",
                    LIST_DWELL_MIN, LIST_DWELL_MAX
                ),
            );
        }
        self.list_dwell.extend(
            values
                .into_iter()
                .map(|v| v.clamp(LIST_DWELL_MIN, LIST_DWELL_MAX)),
        );
    }

    fn start_list(&mut self, function: Function) {
        if self.playback.is_some() {
            self.push_error(-221, "Settings conflict; list already running");
            return;
        }
        let points = match function {
            Function::Volt => self.list_volt.len(),
            Function::Curr => self.list_curr.len(),
        };
        if points == 0 {
            self.push_error(-200, "Execution error; list empty");
            self.stop_list();
            return;
        }
        let dwells = match self.list_dwell.len() {
            1 => vec![self.list_dwell[0]; points],
            n if n == points => self.list_dwell.clone(),
            _ => {
                self.push_error(-221, "Settings conflict; dwell/point mismatch");
                self.stop_list();
                return;
            }
        };
        let period: f64 = dwells.iter().sum();
        let length = (self.list_count > 0)
            .then(|| Duration::from_secs_f64(period * f64::from(self.list_count)));

        tracing::debug!(%function, points, count = self.list_count, "List playback started");
        self.playback = Some(Playback {
            started: Instant::now(),
            function,
            length,
        });
    }

    /// Retire a playback whose time is up.
    fn refresh(&mut self) {
        let finished = self.playback.as_ref().is_some_and(|p| {
            p.length
                .is_some_and(|length| p.started.elapsed() >= length)
        });
        if finished {
            self.stop_list();
        }
    }

    fn measure(&self, quantity: Function) -> f64 {
        if !self.output_on {
            return 0.0;
        }
        let fixed = match quantity {
            Function::Volt => self.volt_setpoint,
            Function::Curr => self.curr_setpoint,
        };
        let Some(playback) = self.playback.as_ref().filter(|p| p.function == quantity) else {
            return fixed;
        };
        let list = match quantity {
            Function::Volt => &self.list_volt,
            Function::Curr => &self.list_curr,
        };
        self.step_at(list.len(), playback.started.elapsed())
            .and_then(|i| list.get(i).copied())
            .unwrap_or(fixed)
    }

    fn step_at(&self, points: usize, elapsed: Duration) -> Option<usize> {
        let dwell_of = |i: usize| {
            self.list_dwell
                .get(i)
                .or_else(|| self.list_dwell.first())
                .copied()
        };
        let period: f64 = (0..points).filter_map(dwell_of).sum();
        if period <= 0.0 {
            return None;
        }
        let mut t = elapsed.as_secs_f64() % period;
        for i in 0..points {
            let d = dwell_of(i)?;
            if t < d {
                return Some(i);
            }
            t -= d;
        }
        points.checked_sub(1)
    }
}

fn flag(on: bool) -> String {
    let s = if on { "1" } else { "0" };
    s.to_string()
}

/// Argument text after `prefix`, matched case-insensitively.
fn argument<'a>(cmd: &'a str, upper: &str, prefix: &str) -> Option<&'a str> {
    upper
        .starts_with(prefix)
        .then(|| cmd.get(prefix.len()..))
        .flatten()
        .map(str::trim)
}

fn parse_float(arg: &str) -> Option<f64> {
    arg.trim().parse().ok()
}

fn parse_int(arg: &str) -> Option<i64> {
    let v: f64 = arg.trim().parse().ok()?;
    v.is_finite().then_some(v as i64)
}

/// Up to `max` comma-separated values. Any malformed token discards the
/// whole command.
fn parse_float_list(arg: &str, max: usize) -> Vec<f64> {
    let parsed: Result<Vec<f64>, _> = arg
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .take(max)
        .map(str::parse::<f64>)
        .collect();
    parsed.unwrap_or_default()
}

fn append_capped(list: &mut Vec<f64>, arg: &str) {
    let space = MAX_LIST_POINTS.saturating_sub(list.len());
    list.extend(parse_float_list(arg, space));
}

/// `1.500000E+00` style, as the device reports readbacks.
fn scientific(v: f64) -> String {
    let s = format!("{:.6E}", v);
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}E{}{:02}", mantissa, sign, exp.abs())
        }
        None => s,
    }
}
