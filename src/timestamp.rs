use mediapipe::utils::timing::ClockTime;

/// Formats a running time as `HH:MM:SS.mmm`. Negative times clamp to zero.
pub fn time_str(time: ClockTime) -> String {
    let ms = time.nanos().max(0) as u64 / 1_000_000;
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let milliseconds = ms % 1000;

    format!(
        "{hours:0width$}:{minutes:02}:{seconds:02}.{milliseconds:03}",
        width = if hours >= 100 { 0 } else { 2 }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_running_time() {
        assert_eq!(time_str(ClockTime::ZERO), "00:00:00.000");
        assert_eq!(time_str(ClockTime::from_millis(3_723_042)), "01:02:03.042");
        assert_eq!(time_str(ClockTime::from_millis(-5)), "00:00:00.000");
    }
}
