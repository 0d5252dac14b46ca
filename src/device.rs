/// A peripheral clocked in lockstep with the CPU.
///
/// The computer delivers one `tick()` per simulated clock pulse, to every
/// device in registration order, after each CPU instruction. Devices keep
/// any waiting they do as internal countdowns.
pub trait Device {
    fn name(&self) -> &str;

    /// Advances the device by one clock pulse.
    fn tick(&mut self);

    /// Advances the device by `count` pulses. Overrides must behave exactly
    /// like calling `tick()` `count` times.
    fn tick_n(&mut self, count: u32) {
        for _ in 0..count {
            self.tick();
        }
    }

    fn reset(&mut self) {}
}
