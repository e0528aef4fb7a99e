/// One terabyte, in the provider's binary accounting (1024^4 bytes).
pub const TB: u64 = 1 << 40;

pub fn format_traffic(bytes: u64, limit_tb: u64) -> String {
    format!("{:.2}/{} TB", bytes as f64 / TB as f64, limit_tb)
}

/// Severity marker for a traffic level relative to the monthly allowance.
pub fn traffic_emoji(traffic_tb: f64, limit_tb: u64) -> &'static str {
    let percentage = traffic_tb / limit_tb as f64 * 100.0;
    if percentage >= 85.0 {
        "🔴"
    } else if percentage >= 70.0 {
        "🟠"
    } else if percentage >= 50.0 {
        "🟡"
    } else if percentage >= 25.0 {
        "🟢"
    } else {
        "⚪"
    }
}
