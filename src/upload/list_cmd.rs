//! LIST command serialization.
//!
//! The BIT 802E input buffer holds 253 bytes, so list data is split into
//! several `LIST:VOLT`/`LIST:CURR`/`LIST:DWEL` commands, each bounded both
//! by value count and by byte length.

use super::ListMode;
use crate::waveform::Chunk;
use std::time::Duration;

/// One list-data command and the number of values it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Full command text, without terminator.
    pub command: String,
    /// Values carried.
    pub count: usize,
}

/// Format a setpoint: four decimals, trailing zeros removed.
///
/// `1.5` becomes `1.5`, `10.0` becomes `10`, `0.12345` becomes `0.1235`.
#[must_use]
pub fn format_value(value: f64) -> String {
    let mut s = format!("{:.4}", value);
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    if s == "-0" {
        s = "0".to_string();
    }
    s
}

/// Format a dwell in seconds with microsecond resolution.
#[must_use]
pub fn format_dwell(dwell: Duration) -> String {
    format!("{:.6}", dwell.as_secs_f64())
}

/// Pack formatted items into `prefix`-led, comma-separated commands.
///
/// A command is closed before adding an item would exceed `max_values`
/// items or `byte_limit` bytes. A single oversized item still gets its own
/// command.
#[must_use]
pub fn batch<I>(prefix: &str, items: I, max_values: usize, byte_limit: usize) -> Vec<Batch>
where
    I: IntoIterator<Item = String>,
{
    let max_values = max_values.max(1);
    let mut batches = Vec::new();
    let mut body = String::new();
    let mut count = 0;

    for item in items {
        let grown = if count == 0 {
            prefix.len() + item.len()
        } else {
            prefix.len() + body.len() + 1 + item.len()
        };
        if count > 0 && (grown > byte_limit || count + 1 > max_values) {
            batches.push(Batch {
                command: format!("{}{}", prefix, body),
                count,
            });
            body.clear();
            count = 0;
        }
        if count > 0 {
            body.push(',');
        }
        body.push_str(&item);
        count += 1;
    }

    if count > 0 {
        batches.push(Batch {
            command: format!("{}{}", prefix, body),
            count,
        });
    }
    batches
}

/// Commands that prepare the device for a new list, in manual order.
///
/// `FUNC:MODE`, `RANG`, `LIST:CLE`, `*WAI`, then the dwell definition: one
/// `LIST:DWEL` when the chunk's dwell is uniform, batched per-point dwell
/// otherwise.
#[must_use]
pub fn setup_commands(
    mode: ListMode,
    chunk: &Chunk<'_>,
    max_values: usize,
    byte_limit: usize,
) -> Vec<String> {
    let m = mode.mnemonic();
    let mut cmds = vec![
        format!("FUNC:MODE {}", m),
        format!("{}:RANG 1", m),
        "LIST:CLE".to_string(),
        "*WAI".to_string(),
    ];
    match chunk.uniform_dwell() {
        Some(dwell) => cmds.push(format!("LIST:DWEL {}", format_dwell(dwell))),
        None => cmds.extend(
            batch(
                "LIST:DWEL ",
                chunk.dwells().map(format_dwell),
                max_values,
                byte_limit,
            )
            .into_iter()
            .map(|b| b.command),
        ),
    }
    cmds
}

/// The chunk's setpoints as batched `LIST:VOLT`/`LIST:CURR` commands.
#[must_use]
pub fn value_commands(
    mode: ListMode,
    chunk: &Chunk<'_>,
    max_values: usize,
    byte_limit: usize,
) -> Vec<Batch> {
    let prefix = format!("LIST:{} ", mode.mnemonic());
    batch(&prefix, chunk.values().map(format_value), max_values, byte_limit)
}

/// Point-count query for the list in `mode`.
#[must_use]
pub fn point_query(mode: ListMode) -> String {
    format!("LIST:{}:POIN?", mode.mnemonic())
}

/// Parse a point-count response (`1000`, `+1000`, `1.000000E+03`).
#[must_use]
pub fn parse_count(response: &str) -> Option<usize> {
    let r = response.trim();
    if let Ok(n) = r.parse::<usize>() {
        return Some(n);
    }
    let f = r.parse::<f64>().ok()?;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= usize::MAX as f64)
        .then_some(f as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{LIST_CMD_BYTE_LIMIT, LIST_VALUES_PER_CMD};
    use crate::waveform::{validate, WaveformPoint};

    #[test]
    fn values_are_compact() {
        assert_eq!(format_value(1.5), "1.5");
        assert_eq!(format_value(10.0), "10");
        assert_eq!(format_value(0.12345), "0.1235");
        assert_eq!(format_value(-2.25), "-2.25");
        assert_eq!(format_value(-0.00001), "0");
        assert_eq!(format_value(0.0), "0");
    }

    #[test]
    fn dwell_has_six_decimals() {
        assert_eq!(format_dwell(Duration::from_micros(500)), "0.000500");
        assert_eq!(format_dwell(Duration::from_secs(10)), "10.000000");
    }

    #[test]
    fn batches_respect_value_count() {
        let items = (0..25).map(|i| i.to_string());
        let batches = batch("LIST:VOLT ", items, LIST_VALUES_PER_CMD, LIST_CMD_BYTE_LIMIT);

        assert_eq!(
            batches.iter().map(|b| b.count).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(batches[0].command, "LIST:VOLT 0,1,2,3,4,5,6,7,8,9");
        assert_eq!(batches[2].command, "LIST:VOLT 20,21,22,23,24");
    }

    #[test]
    fn batches_respect_byte_limit() {
        let items = (0..40).map(|_| "-12.3456".to_string());
        let batches = batch("LIST:CURR ", items, 100, 60);

        assert!(batches.iter().all(|b| b.command.len() <= 60));
        assert_eq!(batches.iter().map(|b| b.count).sum::<usize>(), 40);
    }

    #[test]
    fn oversized_item_gets_its_own_command() {
        let items = vec!["1".to_string(), "x".repeat(50), "2".to_string()];
        let batches = batch("P ", items, 10, 20);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].count, 1);
    }

    #[test]
    fn setup_follows_manual_order() {
        let ms = Duration::from_millis(1);
        let wf = validate(vec![WaveformPoint::new(1.0, ms); 3]).unwrap();
        let chunks = wf.chunk(1000);
        let cmds = setup_commands(ListMode::Voltage, &chunks[0], 10, 200);
        assert_eq!(
            cmds,
            vec![
                "FUNC:MODE VOLT",
                "VOLT:RANG 1",
                "LIST:CLE",
                "*WAI",
                "LIST:DWEL 0.001000",
            ]
        );
    }

    #[test]
    fn per_point_dwell_is_batched() {
        let pts = vec![
            WaveformPoint::new(1.0, Duration::from_millis(1)),
            WaveformPoint::new(2.0, Duration::from_millis(2)),
        ];
        let wf = validate(pts).unwrap();
        let chunks = wf.chunk(1000);
        let cmds = setup_commands(ListMode::Current, &chunks[0], 10, 200);
        assert_eq!(cmds[0], "FUNC:MODE CURR");
        assert_eq!(cmds[4], "LIST:DWEL 0.001000,0.002000");
        assert_eq!(point_query(ListMode::Current), "LIST:CURR:POIN?");
    }

    #[test]
    fn counts_parse_in_device_formats() {
        assert_eq!(parse_count("1000"), Some(1000));
        assert_eq!(parse_count(" +999 "), Some(999));
        assert_eq!(parse_count("1.000000E+03"), Some(1000));
        assert_eq!(parse_count("12.5"), None);
        assert_eq!(parse_count("-1"), None);
        assert_eq!(parse_count("garbage"), None);
    }
}
