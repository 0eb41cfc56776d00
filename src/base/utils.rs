use std::fmt;

pub struct FormattedSize {
    pub size: f64,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

/// Parses `12`, `12K`, `1.5M`, `2gb` and friends into a value and its byte factor.
fn parse_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (number, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    number.parse::<f64>().ok().map(|x| (x, factor))
}

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    std::env::var(var)
        .ok()
        .and_then(|value| parse_float_and_factor(&value))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;

    Some((value * factor as f64) as usize)
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    read_float_and_factor_from_env(var).map(|x| x.0)
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match std::env::var(var).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!(target: "gc", "fatal error: {}", args);
    eprintln!("fatal error: {}", args);
    std::process::abort();
}

/// Logs the message and aborts the process. The collector has no recoverable error channel.
#[macro_export]
macro_rules! gc_fatal {
    ($($arg:tt)*) => {
        $crate::base::utils::fatal(format_args!($($arg)*))
    };
}

/// Like `assert!`, but aborts instead of unwinding and stays enabled in release builds.
#[macro_export]
macro_rules! gc_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::gc_fatal!(
                "assertion `{}` failed: {}",
                stringify!($cond),
                format_args!($($arg)*)
            );
        }
    };
}
