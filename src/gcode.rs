// src/gcode.rs
//
// Dispatch of pre-tokenized commands onto the motion pipeline. Tokenizing
// and modal G-code state belong to the upstream interpreter; commands here
// arrive as a name plus parameter map, with coordinates treated as
// absolute millimeters.
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{CommandError, Result, ShutdownState};
use crate::events::EventBus;
use crate::homing::PrinterHoming;
use crate::manual_stepper::ManualStepper;
use crate::mcu::Mcu;
use crate::probe::ProbeG38;
use crate::reactor::Reactor;
use crate::toolhead::Toolhead;

#[derive(Debug, Clone, Default)]
pub struct GCodeCommand {
    pub name: String,
    pub params: HashMap<String, String>,
}

impl GCodeCommand {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_uppercase(),
            params: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_uppercase(), value.to_string());
        self
    }

    /// Minimal line splitter for the demo binary: `G1 X10 F600` or
    /// `MANUAL_STEPPER STEPPER=foo MOVE=5`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = match line.find(';') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let mut cmd = GCodeCommand::new(name);
        for part in parts {
            if let Some((key, value)) = part.split_once('=') {
                cmd.params.insert(key.to_uppercase(), value.to_string());
            } else {
                // Word style: single letter plus value, or a bare flag.
                let (key, value) = part.split_at(1);
                cmd.params.insert(key.to_uppercase(), value.to_string());
            }
        }
        Some(cmd)
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| CommandError::InvalidParam(format!("{key}={raw}"))),
        }
    }

    pub fn get_float_above(&self, key: &str, above: f64) -> Result<Option<f64>> {
        match self.get_float(key)? {
            Some(v) if v <= above => Err(CommandError::InvalidParam(format!(
                "{key} must be above {above}"
            ))),
            other => Ok(other),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| CommandError::InvalidParam(format!("{key}={raw}"))),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

/// Owns the motion pipeline and routes commands into it.
pub struct CommandDispatcher {
    toolhead: Toolhead,
    homing: PrinterHoming,
    probe: Option<ProbeG38>,
    manual_steppers: HashMap<String, ManualStepper>,
    shutdown: ShutdownState,
    /// Modal feedrate in mm/s.
    last_speed: f64,
}

impl CommandDispatcher {
    pub fn build(
        config: &Config,
        mcu: Arc<Mcu>,
        reactor: Reactor,
        events: EventBus,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        let toolhead = Toolhead::new(config, mcu.clone(), reactor, events.clone(), shutdown.clone())?;
        let probe = config.probe.as_ref().map(|cfg| ProbeG38::new(cfg, &toolhead));
        let mut manual_steppers = HashMap::new();
        for (name, cfg) in &config.manual_stepper {
            manual_steppers.insert(
                name.clone(),
                ManualStepper::new(name, cfg, mcu.clone(), events.clone())?,
            );
        }
        Ok(Self {
            toolhead,
            homing: PrinterHoming::new(),
            probe,
            manual_steppers,
            shutdown,
            last_speed: 25.0,
        })
    }

    pub fn toolhead(&self) -> &Toolhead {
        &self.toolhead
    }

    pub fn toolhead_mut(&mut self) -> &mut Toolhead {
        &mut self.toolhead
    }

    pub fn homing(&self) -> &PrinterHoming {
        &self.homing
    }

    pub fn homing_mut(&mut self) -> &mut PrinterHoming {
        &mut self.homing
    }

    pub fn probe(&self) -> Option<&ProbeG38> {
        self.probe.as_ref()
    }

    pub fn manual_stepper(&self, name: &str) -> Option<&ManualStepper> {
        self.manual_steppers.get(name)
    }

    fn axis_letters(&self) -> Vec<char> {
        self.toolhead.axis_names().chars().collect()
    }

    pub async fn execute(&mut self, cmd: &GCodeCommand) -> Result<String> {
        if self.shutdown.is_shutdown() {
            let reason = self
                .shutdown
                .reason()
                .unwrap_or_else(|| "Printer is shutdown".to_string());
            return Err(CommandError::Shutdown(reason));
        }
        tracing::debug!("dispatch {} {:?}", cmd.name, cmd.params);
        match cmd.name.as_str() {
            "G0" | "G1" => self.cmd_g1(cmd).await,
            "G4" => self.cmd_g4(cmd).await,
            "M400" => {
                self.toolhead.wait_moves().await?;
                Ok(String::new())
            }
            "M204" => self.cmd_m204(cmd),
            "SET_VELOCITY_LIMIT" => self.cmd_set_velocity_limit(cmd),
            "G28" => self.cmd_g28(cmd).await,
            "G38.2" => self.cmd_g38(cmd, true, true).await,
            "G38.3" => self.cmd_g38(cmd, false, true).await,
            "G38.4" => self.cmd_g38(cmd, true, false).await,
            "G38.5" => self.cmd_g38(cmd, false, false).await,
            "MANUAL_STEPPER" => self.cmd_manual_stepper(cmd).await,
            "HOME_EXTRUDER" | "HOME_ACTIVE_EXTRUDER" => {
                self.homing.home_extruder(&mut self.toolhead).await?;
                Ok(String::new())
            }
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    async fn cmd_g1(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let axis_count = self.toolhead.axis_count();
        let mut coord: Vec<Option<f64>> = vec![None; axis_count + 1];
        for (i, letter) in self.axis_letters().iter().enumerate() {
            coord[i] = cmd.get_float(&letter.to_string())?;
        }
        coord[axis_count] = cmd.get_float("E")?;
        if let Some(feed) = cmd.get_float_above("F", 0.0)? {
            self.last_speed = feed / 60.0;
        }
        let speed = self.last_speed;
        self.toolhead.manual_move(&coord, speed).await?;
        Ok(String::new())
    }

    async fn cmd_g4(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let millis = cmd.get_float("P")?.unwrap_or(0.0).max(0.0);
        self.toolhead.dwell(millis / 1000.0).await?;
        Ok(String::new())
    }

    fn cmd_m204(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let accel = match cmd.get_float_above("S", 0.0)? {
            Some(s) => s,
            None => {
                let p = cmd.get_float_above("P", 0.0)?;
                let t = cmd.get_float_above("T", 0.0)?;
                match (p, t) {
                    (Some(p), Some(t)) => p.min(t),
                    _ => {
                        return Ok(format!("Invalid M204 command \"{:?}\"", cmd.params));
                    }
                }
            }
        };
        self.toolhead.set_max_accel(accel);
        Ok(String::new())
    }

    fn cmd_set_velocity_limit(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let msg = self.toolhead.set_velocity_limit(
            cmd.get_float_above("VELOCITY", 0.0)?,
            cmd.get_float_above("ACCEL", 0.0)?,
            cmd.get_float("SQUARE_CORNER_VELOCITY")?,
            cmd.get_float_above("ACCEL_TO_DECEL", 0.0)?,
        );
        Ok(msg)
    }

    async fn cmd_g28(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let mut axes = Vec::new();
        for (i, letter) in self.axis_letters().iter().enumerate() {
            if cmd.has(&letter.to_string()) {
                axes.push(i);
            }
        }
        self.homing.cmd_g28(&mut self.toolhead, &axes).await?;
        Ok(String::new())
    }

    async fn cmd_g38(
        &mut self,
        cmd: &GCodeCommand,
        error_out: bool,
        trigger_invert: bool,
    ) -> Result<String> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| CommandError::config("no [probe] section configured"))?;
        let axis_count = self.toolhead.axis_count();
        let mut target = self.toolhead.get_position();
        let mut probe_axes: Vec<String> = Vec::new();
        for (i, letter) in self.axis_letters().iter().enumerate() {
            if let Some(v) = cmd.get_float(&letter.to_string())? {
                target[i] = v;
                probe_axes.push(letter.to_lowercase().to_string());
            }
        }
        if let Some(v) = cmd.get_float("E")? {
            target[axis_count] = v;
            if let Some(e) = self.toolhead.extruder() {
                probe_axes.push(e.name().to_string());
            }
        }
        let speed = match cmd.get_float_above("F", 0.0)? {
            Some(feed) => feed / 60.0,
            None => probe.default_speed(),
        };
        let epos = probe
            .probe(
                &mut self.toolhead,
                &self.homing,
                target,
                speed,
                error_out,
                trigger_invert,
                probe_axes,
            )
            .await?;
        let rendered: Vec<String> = epos.iter().map(|p| format!("{p:.6}")).collect();
        Ok(format!("probe trigger at {}", rendered.join(" ")))
    }

    async fn cmd_manual_stepper(&mut self, cmd: &GCodeCommand) -> Result<String> {
        let name = cmd
            .get_str("STEPPER")
            .ok_or_else(|| CommandError::InvalidParam("STEPPER is required".to_string()))?
            .to_string();
        let stepper = self
            .manual_steppers
            .get_mut(&name)
            .ok_or_else(|| CommandError::InvalidParam(format!("unknown stepper {name}")))?;

        if let Some(enable) = cmd.get_int("ENABLE")? {
            // Driver enable lines are outside the motion core; log only.
            tracing::info!("manual_stepper {name}: enable={}", enable != 0);
        }
        if let Some(setpos) = cmd.get_float("SET_POSITION")? {
            stepper.do_set_position(setpos);
        }
        let speed = cmd
            .get_float_above("SPEED", 0.0)?
            .unwrap_or_else(|| stepper.default_speed());
        let accel = cmd.get_float("ACCEL")?.unwrap_or_else(|| stepper.default_accel());
        if accel < 0.0 {
            return Err(CommandError::InvalidParam("ACCEL must not be negative".into()));
        }
        let homing_move = cmd.get_int("STOP_ON_ENDSTOP")?.unwrap_or(0);
        if homing_move != 0 {
            let movepos = cmd
                .get_float("MOVE")?
                .ok_or_else(|| CommandError::InvalidParam("MOVE is required".to_string()))?;
            stepper
                .do_homing_move(
                    &mut self.toolhead,
                    &self.homing,
                    movepos,
                    speed,
                    accel,
                    homing_move > 0,
                    homing_move.abs() == 1,
                )
                .await?;
        } else if let Some(movepos) = cmd.get_float("MOVE")? {
            let sync = cmd.get_int("SYNC")?.unwrap_or(1) != 0;
            stepper
                .do_move(&mut self.toolhead, movepos, speed, accel, sync)
                .await?;
        } else if cmd.get_int("SYNC")?.unwrap_or(0) != 0 {
            stepper.sync_print_time(&mut self.toolhead).await?;
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_word_style_params() {
        let cmd = GCodeCommand::parse("G1 X10.5 Y-3 F600").expect("cmd");
        assert_eq!(cmd.name, "G1");
        assert_eq!(cmd.get_float("X").expect("x"), Some(10.5));
        assert_eq!(cmd.get_float("Y").expect("y"), Some(-3.0));
        assert_eq!(cmd.get_float("F").expect("f"), Some(600.0));
    }

    #[test]
    fn parses_key_value_params() {
        let cmd =
            GCodeCommand::parse("MANUAL_STEPPER STEPPER=feeder MOVE=25 SPEED=10").expect("cmd");
        assert_eq!(cmd.get_str("STEPPER"), Some("feeder"));
        assert_eq!(cmd.get_float("MOVE").expect("move"), Some(25.0));
    }

    #[test]
    fn bare_axis_flags_are_kept() {
        let cmd = GCodeCommand::parse("G28 X Z").expect("cmd");
        assert!(cmd.has("X"));
        assert!(cmd.has("Z"));
        assert!(!cmd.has("Y"));
    }

    #[test]
    fn strips_comments() {
        assert!(GCodeCommand::parse("; just a comment").is_none());
        let cmd = GCodeCommand::parse("G4 P500 ; half a second").expect("cmd");
        assert_eq!(cmd.get_float("P").expect("p"), Some(500.0));
    }
}
