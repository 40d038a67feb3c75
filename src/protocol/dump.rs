use std::{
    fmt::Write as _,
    fs::OpenOptions,
    io::{self, Write as _},
    path::Path,
};

const BYTES_PER_LINE: usize = 16;

pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (line, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:08x}:", line * BYTES_PER_LINE);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
    out
}

/// Logs an encoded message at trace level and, with a dump directory, appends it to
/// `<dir>/<tag>.txt` (`send`, `recv`, `pack`).
pub fn dump_msg(tag: &str, bytes: &[u8], dump_dir: Option<&Path>) -> io::Result<()> {
    let enabled = log::log_enabled!(log::Level::Trace);
    if !enabled && dump_dir.is_none() {
        return Ok(());
    }

    let text = hex_dump(bytes);
    if enabled {
        log::trace!("[{tag}] {} bytes\n{text}", bytes.len());
    }

    if let Some(dir) = dump_dir {
        std::fs::create_dir_all(dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{tag}.txt")))?;
        writeln!(file, "# {} bytes", bytes.len())?;
        file.write_all(text.as_bytes())?;
    }
    Ok(())
}
