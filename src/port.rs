use std::{fmt, rc::Rc};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::io_block::BitMask;

pub type InputHandler = Rc<dyn Fn(u16) -> u8>;
pub type OutputHandler = Rc<dyn Fn(u16, u8)>;

/// How a 16-bit port address is decoded into a table index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortMode {
    /// Low byte of the address selects the port (Z80 style `IN A,(n)`).
    #[default]
    ByteLow,
    /// High byte selects the port (CPC style gate array decoding).
    ByteHi,
    /// Full 16-bit decode.
    Word,
}

impl PortMode {
    pub fn decode(self, port: u16) -> u16 {
        match self {
            PortMode::ByteLow => port & 0x00FF,
            PortMode::ByteHi => port >> 8,
            PortMode::Word => port,
        }
    }

    fn table_size(self) -> usize {
        match self {
            PortMode::ByteLow | PortMode::ByteHi => 0x100,
            PortMode::Word => 0x10000,
        }
    }
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortMode::ByteLow => write!(f, "BYTE_LOW"),
            PortMode::ByteHi => write!(f, "BYTE_HI"),
            PortMode::Word => write!(f, "WORD"),
        }
    }
}

/// Dispatches CPU `IN`/`OUT` cycles to device handlers.
///
/// Each port has at most one input handler. Output handlers may be chained
/// so several devices observe the same port.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PortConnector {
    mode: PortMode,
    #[derivative(Debug = "ignore")]
    inputs: Vec<Option<InputHandler>>,
    #[derivative(Debug = "ignore")]
    outputs: Vec<Vec<OutputHandler>>,
}

impl PortConnector {
    pub fn new(mode: PortMode) -> Self {
        let size = mode.table_size();
        Self {
            mode,
            inputs: vec![None; size],
            outputs: vec![Vec::new(); size],
        }
    }

    pub fn mode(&self) -> PortMode {
        self.mode
    }

    /// Drops every handler.
    pub fn clear(&mut self) {
        self.inputs.iter_mut().for_each(|h| *h = None);
        self.outputs.iter_mut().for_each(Vec::clear);
    }

    fn check_port(&self, port: u16) -> bool {
        if (port as usize) < self.inputs.len() {
            return true;
        }
        tracing::error!("[PORT] Port {:#06X} out of range for {} mode", port, self.mode);
        false
    }

    /// Connects an input handler at a decoded port number. Fails if the
    /// port already has one, unless `replace` is set.
    pub fn connect_input(&mut self, port: u16, handler: InputHandler, replace: bool) -> bool {
        if !self.check_port(port) {
            return false;
        }
        let slot = &mut self.inputs[port as usize];
        if slot.is_some() && !replace {
            tracing::error!("[PORT] Input port {:#06X} already connected", port);
            return false;
        }
        *slot = Some(handler);
        true
    }

    /// Connects an output handler at a decoded port number. With `share`
    /// the handler is chained after the existing ones.
    pub fn connect_output(&mut self, port: u16, handler: OutputHandler, share: bool) -> bool {
        if !self.check_port(port) {
            return false;
        }
        let chain = &mut self.outputs[port as usize];
        if !chain.is_empty() && !share {
            tracing::error!("[PORT] Output port {:#06X} already connected", port);
            return false;
        }
        chain.push(handler);
        true
    }

    /// Connects `handler` to every decoded port matching `mask`. Nothing is
    /// connected if any matching port is taken.
    pub fn connect_input_mask(&mut self, mask: BitMask, handler: InputHandler, replace: bool) -> bool {
        let ports: Vec<usize> = (0..self.inputs.len())
            .filter(|p| mask.is_match(*p as u16))
            .collect();

        if !replace {
            if let Some(port) = ports.iter().find(|p| self.inputs[**p].is_some()) {
                tracing::error!("[PORT] Input port {:#06X} already connected ({})", port, mask);
                return false;
            }
        }

        for port in &ports {
            self.inputs[*port] = Some(handler.clone());
        }
        tracing::debug!("[PORT] Input mask {} covers {} ports", mask, ports.len());
        true
    }

    pub fn connect_output_mask(&mut self, mask: BitMask, handler: OutputHandler, share: bool) -> bool {
        let ports: Vec<usize> = (0..self.outputs.len())
            .filter(|p| mask.is_match(*p as u16))
            .collect();

        if !share {
            if let Some(port) = ports.iter().find(|p| !self.outputs[**p].is_empty()) {
                tracing::error!("[PORT] Output port {:#06X} already connected ({})", port, mask);
                return false;
            }
        }

        for port in &ports {
            self.outputs[*port].push(handler.clone());
        }
        tracing::debug!("[PORT] Output mask {} covers {} ports", mask, ports.len());
        true
    }

    pub fn disconnect_input(&mut self, port: u16) -> bool {
        if !self.check_port(port) {
            return false;
        }
        self.inputs[port as usize].take().is_some()
    }

    pub fn disconnect_output(&mut self, port: u16) -> bool {
        if !self.check_port(port) {
            return false;
        }
        let chain = &mut self.outputs[port as usize];
        let had = !chain.is_empty();
        chain.clear();
        had
    }

    pub fn is_input_connected(&self, port: u16) -> bool {
        matches!(self.inputs.get(port as usize), Some(Some(_)))
    }

    pub fn is_output_connected(&self, port: u16) -> bool {
        self.outputs
            .get(port as usize)
            .is_some_and(|chain| !chain.is_empty())
    }

    /// CPU `IN` cycle. `port` is the raw 16-bit address from the bus.
    pub fn in_port(&self, port: u16) -> u8 {
        let decoded = self.mode.decode(port);
        match &self.inputs[decoded as usize] {
            Some(handler) => handler(port),
            None => {
                tracing::debug!("[PORT] Read from unbound port {:#06X}", port);
                0xFF
            }
        }
    }

    /// CPU `OUT` cycle. `port` is the raw 16-bit address from the bus.
    pub fn out_port(&self, port: u16, value: u8) {
        let decoded = self.mode.decode(port);
        let chain = &self.outputs[decoded as usize];
        if chain.is_empty() {
            tracing::debug!("[PORT] Write {:#04X} to unbound port {:#06X}", value, port);
            return;
        }
        for handler in chain {
            handler(port, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_modes() {
        assert_eq!(PortMode::ByteLow.decode(0x7FFE), 0xFE);
        assert_eq!(PortMode::ByteHi.decode(0x7FFE), 0x7F);
        assert_eq!(PortMode::Word.decode(0x7FFE), 0x7FFE);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut ports = PortConnector::new(PortMode::ByteLow);
        assert!(!ports.connect_input(0x100, Rc::new(|_| 0), false));
        assert!(!ports.disconnect_output(0x1234));
    }
}
