use std::io::Write;

use serde::Serialize;

use crate::codec::{Command, Disposition, Visitor};

/// Prints one line per decoded command, matching the original tool's output.
///
/// Addresses are zero-padded to 9 hex digits (the reconfig engine's address
/// space), masks and data to their field width.
pub struct TextPrinter<W: Write> {
    out: W,
}

impl<W: Write> TextPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) -> Disposition {
        match self.out.write_fmt(args) {
            Ok(()) => Disposition::Success,
            Err(err) => Disposition::Error(err.into()),
        }
    }
}

impl<W: Write> Visitor for TextPrinter<W> {
    fn end(&mut self) -> Disposition {
        // Trailing blank line separates this sequence from the next.
        self.line(format_args!("end\n\n"))
    }

    fn delay(&mut self, ticks: &mut u32) -> Disposition {
        self.line(format_args!("delay {}\n", ticks))
    }

    fn r32(
        &mut self,
        addr: &mut u64,
        mask: &mut u32,
        data: &mut u32,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        if *retry {
            self.line(format_args!(
                "rd32 {:#011x} & {:#010x} == {:#010x}, retry = {}\n",
                addr, mask, data, recnt
            ))
        } else {
            self.line(format_args!(
                "rd32 {:#011x} & {:#010x} == {:#010x}\n",
                addr, mask, data
            ))
        }
    }

    fn r64(
        &mut self,
        addr: &mut u64,
        mask: &mut u64,
        data: &mut u64,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        if *retry {
            self.line(format_args!(
                "rd64 {:#011x} & {:#018x} == {:#018x}, retry = {}\n",
                addr, mask, data, recnt
            ))
        } else {
            self.line(format_args!(
                "rd64 {:#011x} & {:#018x} == {:#018x}\n",
                addr, mask, data
            ))
        }
    }

    fn w32(&mut self, addr: &mut u64, data: &mut u32) -> Disposition {
        self.line(format_args!("wr32 {:#011x} = {:#010x}\n", addr, data))
    }

    fn w64(&mut self, addr: &mut u64, data: &mut u64) -> Disposition {
        self.line(format_args!("wr64 {:#x} = {:#018x}\n", addr, data))
    }
}

/// Collects decoded commands for JSON output.
#[derive(Default)]
pub struct JsonCollector {
    pub commands: Vec<Command>,
}

impl Visitor for JsonCollector {
    fn end(&mut self) -> Disposition {
        self.commands.push(Command::End);
        Disposition::Success
    }

    fn delay(&mut self, ticks: &mut u32) -> Disposition {
        self.commands.push(Command::Delay { ticks: *ticks });
        Disposition::Success
    }

    fn r32(
        &mut self,
        addr: &mut u64,
        mask: &mut u32,
        data: &mut u32,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        self.commands.push(Command::Read32 {
            addr: *addr,
            mask: *mask,
            data: *data,
            retry: *retry,
            recnt: *recnt,
        });
        Disposition::Success
    }

    fn r64(
        &mut self,
        addr: &mut u64,
        mask: &mut u64,
        data: &mut u64,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        self.commands.push(Command::Read64 {
            addr: *addr,
            mask: *mask,
            data: *data,
            retry: *retry,
            recnt: *recnt,
        });
        Disposition::Success
    }

    fn w32(&mut self, addr: &mut u64, data: &mut u32) -> Disposition {
        self.commands.push(Command::Write32 {
            addr: *addr,
            data: *data,
        });
        Disposition::Success
    }

    fn w64(&mut self, addr: &mut u64, data: &mut u64) -> Disposition {
        self.commands.push(Command::Write64 {
            addr: *addr,
            data: *data,
        });
        Disposition::Success
    }
}

/// One decoded sequence, as emitted in JSON mode.
#[derive(Serialize)]
pub struct SequenceDump {
    /// Byte offset of the sequence within the input file.
    pub offset: u64,
    /// Sequence length in bytes.
    pub len: usize,
    pub commands: Vec<Command>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{visit, TapeConfig};

    // delay 3, rd32 with retry, wr32, end
    fn sample_tape() -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(&((3u32 << 3) | (1 << 2)).to_le_bytes());
        t.extend_from_slice(&(0x0209u32 | (0x1000 << 16)).to_le_bytes());
        t.extend_from_slice(&(0x5u32 << 6).to_le_bytes());
        t.extend_from_slice(&0xffff_0000u32.to_le_bytes());
        t.extend_from_slice(&0x0020_0000u32.to_le_bytes());
        t.extend_from_slice(&(0x2u32 | (0x2000 << 6)).to_le_bytes());
        t.push(0x7);
        t.extend_from_slice(&[0, 0, 0]);
        t.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        t.extend_from_slice(&[0; 4]);
        t
    }

    #[test]
    fn test_text_printer_lines() {
        let t = sample_tape();
        let mut out = Vec::new();
        visit(&t, TapeConfig::extracted(), &mut TextPrinter::new(&mut out)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "delay 3\n\
             rd32 0x000400014 & 0xffff0000 == 0x00200000, retry = 2\n\
             wr32 0x00080001c = 0x12345678\n\
             end\n\n"
        );
    }

    #[test]
    fn test_json_collector_shape() {
        let t = sample_tape();
        let mut collector = JsonCollector::default();
        visit(&t, TapeConfig::extracted(), &mut collector).unwrap();
        assert_eq!(collector.commands.len(), 4);
        assert_eq!(collector.commands[0], Command::Delay { ticks: 3 });
        assert_eq!(collector.commands[3], Command::End);

        let value = serde_json::to_value(&collector.commands).unwrap();
        assert_eq!(value[0]["kind"], "delay");
        assert_eq!(value[1]["kind"], "read32");
        assert_eq!(value[1]["retry"], true);
        assert_eq!(value[2]["kind"], "write32");
        assert_eq!(value[3]["kind"], "end");
    }
}
