//! The I/O command processor.
//!
//! Runs at the task cycle rate: polls its command channel, performs
//! the operation (tool staging is modeled as immediate; a real
//! changer would stretch `busy` across cycles), echoes the serial,
//! and publishes the status snapshot. A failed runtime operation
//! (bad tool table reload) flags `fault` and posts an operator error
//! instead of taking the machine down.

use std::path::Path;

use tracing::{info, warn};

use rmc_channel::{CommandReader, StatusWriter};
use rmc_common::error::OperatorMsgRing;
use rmc_common::io_cmd::{IoCommand, IoStatus};

use crate::tooltable::ToolTable;

pub struct IoController {
    status: IoStatus,
    table: ToolTable,
    table_path: Option<std::path::PathBuf>,
    cmd_rx: CommandReader<IoCommand>,
    status_tx: StatusWriter<IoStatus>,
    pub ops: OperatorMsgRing,
}

impl IoController {
    pub fn new(
        cmd_rx: CommandReader<IoCommand>,
        status_tx: StatusWriter<IoStatus>,
        table: ToolTable,
        table_path: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            status: IoStatus::default(),
            table,
            table_path,
            cmd_rx,
            status_tx,
            ops: OperatorMsgRing::new(),
        }
    }

    #[inline]
    pub fn status(&self) -> &IoStatus {
        &self.status
    }

    #[inline]
    pub fn table(&self) -> &ToolTable {
        &self.table
    }

    /// One task-rate cycle: process at most one command, publish.
    pub fn cycle(&mut self) {
        self.status.heartbeat = self.status.heartbeat.wrapping_add(1);
        self.status.fault = false;

        if let Some((head, cmd)) = self.cmd_rx.poll() {
            self.execute(cmd);
            self.status.echo_serial = head.serial;
            self.cmd_rx.ack(head.serial);
        }

        self.status_tx.publish(&self.status);
    }

    fn execute(&mut self, cmd: IoCommand) {
        match cmd {
            IoCommand::ToolPrepare { pocket } => {
                if (pocket as usize) < crate::tooltable::MAX_POCKETS {
                    self.status.pocket_prepped = pocket as i16;
                } else {
                    self.fail(&format!("pocket {pocket} out of range"));
                }
            }
            IoCommand::ToolLoad => {
                let pocket = self.status.pocket_prepped;
                if pocket < 0 {
                    self.fail("tool load without a prepared pocket");
                    return;
                }
                let entry = *self.table.entry(pocket as usize).unwrap_or(&Default::default());
                self.status.tool_in_spindle = entry.id;
                self.status.tool_length_offset = entry.zoffset;
                self.status.pocket_prepped = -1;
                info!(tool = entry.id, pocket, "tool loaded");
            }
            IoCommand::ToolUnload => {
                self.status.tool_in_spindle = 0;
                self.status.tool_length_offset = 0.0;
            }
            IoCommand::ToolLoadTable { file } => {
                let path = Path::new(file.as_str());
                match ToolTable::load(path) {
                    Ok(table) => {
                        self.table = table;
                        self.table_path = Some(path.to_path_buf());
                        info!(path = %path.display(), "tool table loaded");
                    }
                    Err(e) => self.fail(&format!("tool table reload failed: {e}")),
                }
            }
            IoCommand::ToolSetOffset {
                tool,
                length,
                diameter,
            } => {
                match self.table.pocket_of(tool) {
                    Some(pocket) => {
                        let entry = self.table.entry_mut(pocket).unwrap();
                        entry.zoffset = length;
                        entry.diameter = diameter;
                        if self.status.tool_in_spindle == tool {
                            self.status.tool_length_offset = length;
                        }
                        // Persist so a restart sees the touched-off
                        // value.
                        if let Some(path) = self.table_path.clone() {
                            if let Err(e) = self.table.save(&path) {
                                warn!("tool table save failed: {e}");
                            }
                        }
                    }
                    None => self.fail(&format!("tool {tool} is not in the table")),
                }
            }
            IoCommand::CoolantMistOn => self.status.coolant_mist = true,
            IoCommand::CoolantMistOff => self.status.coolant_mist = false,
            IoCommand::CoolantFloodOn => self.status.coolant_flood = true,
            IoCommand::CoolantFloodOff => self.status.coolant_flood = false,
            IoCommand::LubeOn => self.status.lube = true,
            IoCommand::LubeOff => self.status.lube = false,
            IoCommand::AuxEstopOn => {
                self.status.estop = true;
                info!("aux estop asserted");
            }
            IoCommand::AuxEstopOff | IoCommand::AuxEstopReset => {
                self.status.estop = false;
            }
        }
    }

    fn fail(&mut self, why: &str) {
        self.status.fault = true;
        self.ops.error(why);
    }
}
