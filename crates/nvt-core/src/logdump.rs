//! Buffer hexdump for test diagnostics.

/// Renders `buf` as 16-byte rows with hex and ASCII columns under a header
/// line.
pub fn log_buf_dump(header: &str, buf: &[u8]) -> String {
    let mut out = format!("{header} (length {})\n", buf.len());
    for (row, chunk) in buf.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
