#![no_main]
use libfuzzer_sys::fuzz_target;

// Devices send whatever they like (including boot noise), none of which may
// take us down.
fuzz_target!(|data: &[u8]| {
    let line = healthlog::frame::line_to_text(data);
    let Ok(mut record) = healthlog::frame::decode_frame(&line) else {
        return;
    };
    record.set_timestamp("2000-01-01 00:00:00".to_string());
    let row = healthlog::sink::csv_row(&record);
    assert!(!row.is_empty());
});
