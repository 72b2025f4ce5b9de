//! time.rs — Module `time`.
//!
//! `sleep` garde le verrou VM pendant l'attente : l'état de pile n'est
//! pas thread-safe et le relâcher ici n'est pas sûr. `process.receive`
//! est la voie bloquante qui coopère.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_number;

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native("now", 0, |_| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Value::Number(secs))
    });

    vm.define_native("now_ms", 0, |_| {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        Ok(Value::Number(ms))
    });

    vm.define_native("sleep", 1, |args| {
        let ms = want_number("time.sleep", args, 0)?;
        if ms > 0.0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
        Ok(Value::Nil)
    });

    vm.define_native_vm("format", 1, |vm, args| {
        let epoch = want_number("time.format", args, 0)?;
        Ok(vm.make_string_value(format_epoch(epoch as i64)))
    });

    Ok(())
}

/// Rendu `YYYY-MM-DD HH:MM:SS` (UTC) d'un timestamp en secondes.
/// Conversion civile jours ↔ date sans dépendance calendrier.
fn format_epoch(secs: i64) -> String {
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02} {h:02}:{m:02}:{s:02}")
}

/// Jours depuis l'époque → (année, mois, jour) du calendrier grégorien.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
