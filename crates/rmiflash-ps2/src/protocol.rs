//! PS/2 auxiliary port command layer
//!
//! RMI registers on PS/2 touchpads are reached through a back door of
//! ordinary mouse commands: the register address and data bytes are smuggled
//! in as "set sample rate" arguments and reads come back as status request
//! responses. Every command byte is acknowledged by the device, with resend
//! and error replies driving retries.

use std::io;

use rmiflash_core::transport::Delay;

use crate::error::{Ps2Error, Result};

/// Aux port commands
pub mod cmd {
    /// Full RMI back door, sample rate argument
    pub const FULL_RMI_BACK_DOOR: u8 = 0x7f;
    /// IBM read secondary id
    pub const IBM_READ_SECONDARY_ID: u8 = 0xe1;
    /// Set scaling 1:1
    pub const SET_SCALING_1_TO_1: u8 = 0xe6;
    /// Set scaling 2:1
    pub const SET_SCALING_2_TO_1: u8 = 0xe7;
    /// Set resolution
    pub const SET_RESOLUTION: u8 = 0xe8;
    /// Status request
    pub const STATUS_REQUEST: u8 = 0xe9;
    /// Set sample rate
    pub const SET_SAMPLE_RATE: u8 = 0xf3;
    /// Disable data reporting
    pub const DISABLE: u8 = 0xf5;
    /// Reset
    pub const RESET: u8 = 0xff;
}

/// Device replies
pub mod reply {
    /// Command accepted
    pub const ACK: u8 = 0xfa;
    /// Command failed twice
    pub const ERROR: u8 = 0xfc;
    /// Send the command again
    pub const RESEND: u8 = 0xfe;
    /// First byte of the power-on announcement
    pub const SELF_TEST_PASSED: u8 = 0xaa;
}

/// Status request arguments
pub mod status {
    /// Identify Synaptics
    pub const IDENTIFY_SYNAPTICS: u8 = 0x00;
    /// Read capabilities, byte 2 carries the product sub id
    pub const READ_CAPABILITIES: u8 = 0x02;
    /// Extra capabilities 2, the firmware build id
    pub const READ_EXTRA_CAPABILITIES_2: u8 = 0x0a;
}

/// Sample rate sequence that switches the back door on
const SET_MODE_BYTE_2: u8 = 0x14;

const TOUCHPAD_RESPONSE: u8 = 0x47;
const STYK_JYT_SYNA: u8 = 5;
const STYK_SYNAPTICS: u8 = 6;

const ACK_TRIES: u32 = 60;
const ACK_TIMEOUT_MS: u32 = 10;
const BYTE_TIMEOUT_MS: u32 = 10;
const RESET_TIMEOUT_MS: u32 = 500;
const DRAIN_TIMEOUT_MS: u32 = 20;
const DRAIN_MAX: usize = 0xffff;
const REGISTER_SETTLE_MS: u32 = 20;
const RESEND_DELAY_MS: u32 = 1000;
const ERROR_DELAY_MS: u32 = 10;

/// Byte level access to the aux port
pub trait ByteChannel {
    /// Send one byte
    fn send(&mut self, byte: u8) -> io::Result<()>;

    /// Receive one byte, `None` on timeout
    fn recv(&mut self, timeout_ms: u32) -> io::Result<Option<u8>>;

    /// Discard anything already queued for reading
    fn flush_input(&mut self) -> io::Result<()>;
}

/// Command layer over a [`ByteChannel`]
pub struct Ps2Port<C, D> {
    channel: C,
    delay: D,
    rmi_mode: bool,
}

impl<C: ByteChannel, D: Delay> Ps2Port<C, D> {
    /// Wrap `channel`, the device starts outside RMI mode
    pub fn new(channel: C, delay: D) -> Self {
        Self {
            channel,
            delay,
            rmi_mode: false,
        }
    }

    /// Underlying channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn recv_byte(&mut self, timeout_ms: u32, what: &'static str) -> Result<u8> {
        self.channel.recv(timeout_ms)?.ok_or(Ps2Error::Timeout(what))
    }

    fn read_ack(&mut self) -> Result<u8> {
        for i in 0..ACK_TRIES {
            match self.channel.recv(ACK_TIMEOUT_MS)? {
                Some(b) => return Ok(b),
                None => log::debug!("ps2: ack timed out: {}", i),
            }
        }
        Err(Ps2Error::Timeout("ack"))
    }

    /// Send `byte` and wait for the acknowledge
    ///
    /// Resend and error replies re-send the byte. With `allow_failure` a
    /// missing acknowledge is not an error; the device does not answer
    /// every command (reset).
    pub fn write_byte(&mut self, byte: u8, allow_failure: bool) -> Result<()> {
        let mut do_write = true;
        for i in 0.. {
            if do_write {
                self.channel.flush_input()?;
                self.channel.send(byte)?;
            }
            do_write = false;

            loop {
                let res = match self.read_ack() {
                    Ok(res) => res,
                    Err(e) => {
                        if i > 3 {
                            return Err(e);
                        }
                        log::warn!("ps2: read ack failed: {}, retrying", e);
                        break;
                    }
                };
                match res {
                    reply::ACK => return Ok(()),
                    reply::RESEND => {
                        log::debug!("ps2: resend");
                        do_write = true;
                        self.delay.delay_ms(RESEND_DELAY_MS);
                        break;
                    }
                    reply::ERROR => {
                        log::debug!("ps2: error");
                        do_write = true;
                        self.delay.delay_ms(ERROR_DELAY_MS);
                        break;
                    }
                    other => {
                        log::debug!("ps2: other response: 0x{:02x}", other);
                        self.delay.delay_ms(ERROR_DELAY_MS);
                    }
                }
            }

            if i >= 3 {
                if allow_failure {
                    break;
                }
                return Err(Ps2Error::RetriesExhausted(byte));
            }
        }
        Ok(())
    }

    fn send_all(&mut self, bytes: &[u8]) -> Result<()> {
        bytes.iter().try_for_each(|&b| self.write_byte(b, false))
    }

    /// Encode `arg` as four set resolution commands, two bits each
    fn set_resolution_sequence(&mut self, arg: u8, send_e6s: bool) -> Result<()> {
        let scalings = if send_e6s { 2 } else { 1 };
        for _ in 0..scalings {
            self.write_byte(cmd::SET_SCALING_1_TO_1, false)?;
        }
        for i in (0..4).rev() {
            let two_bits = (arg >> (i * 2)) & 0x3;
            self.send_all(&[cmd::SET_RESOLUTION, two_bits])?;
        }
        Ok(())
    }

    /// Synaptics status request, returns the three response bytes big endian
    pub fn status_request(&mut self, arg: u8) -> Result<u32> {
        let mut sent = false;
        for i in 0..3 {
            let res = self
                .set_resolution_sequence(arg, false)
                .and_then(|()| self.write_byte(cmd::STATUS_REQUEST, false));
            match res {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(e) => log::debug!("ps2: status request try #{} failed: {}", i, e),
            }
        }
        if !sent {
            return Err(Ps2Error::RetriesExhausted(cmd::STATUS_REQUEST));
        }

        let mut value = 0u32;
        for _ in 0..3 {
            let b = self.recv_byte(BYTE_TIMEOUT_MS, "status response")?;
            value = (value << 8) | u32::from(b);
        }
        Ok(value)
    }

    fn sample_rate_sequence(&mut self, param: u8, arg: u8, mut send_e6s: bool) -> Result<()> {
        for i in 0.. {
            if i > 0 {
                // always send two E6s when retrying
                send_e6s = true;
            }
            let res = self
                .set_resolution_sequence(arg, send_e6s)
                .and_then(|()| self.send_all(&[cmd::SET_SAMPLE_RATE, param]));
            match res {
                Ok(()) => break,
                Err(e) if i > 3 => return Err(e),
                Err(e) => log::warn!("ps2: sample rate sequence failed, will retry: {}", e),
            }
        }
        Ok(())
    }

    /// Reset the device and stop it streaming finger data
    ///
    /// Anything left in the input queue is discarded first. The device
    /// announces itself with `AA 00` after the reset.
    pub fn reset_and_disable(&mut self) -> Result<()> {
        for _ in 0..DRAIN_MAX {
            if self.channel.recv(DRAIN_TIMEOUT_MS)?.is_none() {
                break;
            }
        }

        self.write_byte(cmd::RESET, false)?;
        let got = [
            self.recv_byte(RESET_TIMEOUT_MS, "reset announcement")?,
            self.recv_byte(RESET_TIMEOUT_MS, "reset announcement")?,
        ];
        if got != [reply::SELF_TEST_PASSED, 0x00] {
            return Err(Ps2Error::UnexpectedResponse {
                expected: vec![reply::SELF_TEST_PASSED, 0x00],
                got: got.to_vec(),
            });
        }

        self.write_byte(cmd::DISABLE, false)?;
        self.rmi_mode = false;
        Ok(())
    }

    /// Switch the back door on, unless already active and not `force`
    pub fn enter_rmi_mode(&mut self, force: bool) -> Result<()> {
        if self.rmi_mode && !force {
            return Ok(());
        }
        self.write_byte(cmd::DISABLE, false)?;
        self.sample_rate_sequence(SET_MODE_BYTE_2, cmd::FULL_RMI_BACK_DOOR, false)?;
        self.rmi_mode = true;
        Ok(())
    }

    /// Write `data` to register `addr` of the current page
    pub fn write_register(&mut self, addr: u8, data: &[u8], allow_failure: bool) -> Result<()> {
        self.enter_rmi_mode(false)?;
        for b in [cmd::SET_SCALING_2_TO_1, cmd::SET_SAMPLE_RATE, addr] {
            self.write_byte(b, allow_failure)?;
        }
        for &b in data {
            self.write_byte(cmd::SET_SAMPLE_RATE, allow_failure)?;
            self.write_byte(b, allow_failure)?;
        }
        self.delay.delay_ms(REGISTER_SETTLE_MS);
        Ok(())
    }

    fn request_register(&mut self, addr: u8) -> Result<()> {
        self.send_all(&[
            cmd::SET_SCALING_2_TO_1,
            cmd::SET_SAMPLE_RATE,
            addr,
            cmd::STATUS_REQUEST,
        ])
    }

    /// Read register `addr` of the current page
    pub fn read_register(&mut self, addr: u8) -> Result<u8> {
        self.enter_rmi_mode(false)?;
        let mut retries = 0;
        let value = loop {
            self.request_register(addr)?;
            match self.channel.recv(BYTE_TIMEOUT_MS)? {
                Some(b) => break b,
                None if retries >= 2 => return Err(Ps2Error::Timeout("register read")),
                None => {
                    retries += 1;
                    log::debug!("ps2: read of 0x{:02x} timed out, retrying", addr);
                }
            }
        };
        self.delay.delay_ms(REGISTER_SETTLE_MS);
        Ok(value)
    }

    /// Stream `len` bytes from packet register `addr`
    pub fn read_packet_register(&mut self, addr: u8, len: usize) -> Result<Vec<u8>> {
        self.enter_rmi_mode(false)?;
        self.request_register(addr)?;
        let mut buf = Vec::with_capacity(len);
        for _ in 0..len {
            buf.push(self.recv_byte(BYTE_TIMEOUT_MS, "packet register")?);
        }
        self.delay.delay_ms(REGISTER_SETTLE_MS);
        Ok(buf)
    }

    /// Product sub id from the capabilities response
    pub fn query_product_sub_id(&mut self) -> Result<u8> {
        let caps = self.status_request(status::READ_CAPABILITIES)?;
        Ok(((caps >> 8) & 0xff) as u8)
    }

    fn detect_synaptics_styk(&mut self) -> Result<bool> {
        self.write_byte(cmd::IBM_READ_SECONDARY_ID, false)?;
        let id = self.recv_byte(BYTE_TIMEOUT_MS, "secondary id")?;
        Ok(id == STYK_JYT_SYNA || id == STYK_SYNAPTICS)
    }

    /// Firmware build id, `None` for devices that are neither a Synaptics
    /// touchpad nor a Synaptics TouchStyk
    ///
    /// The status requests leave RMI mode.
    pub fn query_build_id(&mut self) -> Result<Option<u32>> {
        let ident = self.status_request(status::IDENTIFY_SYNAPTICS)?;
        log::debug!("ps2: identify Synaptics response 0x{:06x}", ident);
        let response = ((ident >> 8) & 0xff) as u8;
        let styk = self.detect_synaptics_styk()?;
        self.rmi_mode = false;
        if response != TOUCHPAD_RESPONSE && !styk {
            return Ok(None);
        }
        let build_id = self.status_request(status::READ_EXTRA_CAPABILITIES_2)?;
        Ok(Some(build_id))
    }

    /// Sleep through the port's delay provider
    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}
