/// I/O port base of the first 16550 serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;
