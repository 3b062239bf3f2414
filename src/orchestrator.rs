use crate::ack::Poller;
use crate::config::WorkflowConfig;
use crate::error::{ActionError, StepError};
use crate::gantry::Gantry;
use crate::messages::{Position, SystemStatus};
use crate::printer_spool::{PrinterSpool, DEFAULT_INTAKE_PROBE_TIMEOUT};
use crate::storage::{FilamentSlot, Storage};
use crate::talker::{Link, Talker};

const INTAKE_SENSOR: &str = "intake_sensor";

/// Turn a failed step into a workflow-aborting error naming the action
fn check<T>(action: &str, result: Result<T, StepError>) -> Result<T, ActionError> {
    result.map_err(|source| ActionError::Failed {
        action: action.to_string(),
        source,
    })
}

/// Sequences the three device controllers into end-to-end workflows
///
/// Steps run strictly one after another and the first failure aborts the
/// workflow. Nothing is retried here and nothing is rolled back; the
/// devices stay wherever the failed step left them until `home_state()`.
pub struct Orchestrator<S> {
    gantry: Gantry<S>,
    storage: Storage<S>,
    printer_spool: PrinterSpool<S>,
    workflow: WorkflowConfig,
}

impl<S: Link> Orchestrator<S> {
    pub fn new(
        gantry: Talker<S>,
        storage: Talker<S>,
        printer_spool: Talker<S>,
        workflow: WorkflowConfig,
    ) -> Result<Self, ActionError> {
        let slot = FilamentSlot::try_from(workflow.default_slot).map_err(ActionError::InvalidSlot)?;

        Ok(Self {
            gantry: Gantry::new(gantry),
            storage: Storage::new(storage, slot),
            printer_spool: PrinterSpool::new(printer_spool),
            workflow,
        })
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            gantry: self.gantry.status(),
            storage: self.storage.status(),
            printer_spool: self.printer_spool.status(),
        }
    }

    /// Select the storage slot (1-4) used by subsequent loads
    pub fn set_slot(&mut self, slot: u8) -> Result<(), ActionError> {
        let slot = FilamentSlot::try_from(slot).map_err(ActionError::InvalidSlot)?;
        self.storage.change_slot(slot);
        Ok(())
    }

    /// Release both stations and home the gantry
    pub async fn home_state(&mut self) -> Result<(), ActionError> {
        tracing::info!("Workflow home_state started");

        let result = self.run_home_state().await;
        Self::report("home_state", &result);
        result
    }

    async fn run_home_state(&mut self) -> Result<(), ActionError> {
        check("undock()", self.storage.undock().await)?;
        check("undock()", self.printer_spool.undock().await)?;
        // Both stations have let go, so the gantry is free whatever it last recorded
        self.gantry.force_undocked();
        check("home()", self.gantry.home().await)?;
        Ok(())
    }

    /// Drive the gantry to a station and latch it there
    pub async fn move_gantry_to(&mut self, location: &str) -> Result<(), ActionError> {
        let target = match location.parse::<Position>() {
            Ok(position) if position.is_dock() => position,
            _ => return Err(ActionError::InvalidLocation(location.to_string())),
        };

        tracing::info!("Workflow move_gantry_to({}) started", target);
        let result = self.run_move_gantry_to(target).await;
        Self::report("move_gantry_to", &result);
        result
    }

    async fn run_move_gantry_to(&mut self, target: Position) -> Result<(), ActionError> {
        check(
            &format!("move_to({})", target),
            self.gantry.move_to(target).await,
        )?;

        match target {
            Position::Storage1 => check("dock()", self.storage.dock().await)?,
            Position::Printer1 => check("dock()", self.printer_spool.dock().await)?,
            Position::Home | Position::Unknown => {
                return Err(ActionError::InvalidLocation(target.to_string()))
            }
        }

        // The station's latch holds the gantry too
        self.gantry.mark_docked_at(target);
        Ok(())
    }

    /// Feed filament from the active storage slot onto the gantry spool
    pub async fn load_gantry_with_filament(
        &mut self,
        amount_secs: u32,
        speed: u32,
    ) -> Result<(), ActionError> {
        tracing::info!(
            "Workflow load_gantry_with_filament({}, {}) started",
            amount_secs,
            speed
        );

        let result = self.run_load_gantry(amount_secs, speed).await;
        Self::report("load_gantry_with_filament", &result);
        result
    }

    async fn run_load_gantry(&mut self, amount_secs: u32, speed: u32) -> Result<(), ActionError> {
        check("deliver_filament()", self.storage.deliver_filament().await)?;

        let mut poller = Poller::new(
            self.workflow.poll_interval(),
            self.workflow.intake_poll_timeout(),
        );
        while !check("check_intake()", self.gantry.check_intake().await)? {
            poller
                .wait()
                .await
                .map_err(|waited| ActionError::PollTimeout {
                    action: "check_intake()".to_string(),
                    waited,
                })?;
        }

        check("stop()", self.storage.stop().await)?;

        let amount = self.workflow.extrude_amount;
        check(
            &format!("extruder({})", amount),
            self.storage.extruder(amount).await,
        )?;
        check("intake()", self.gantry.intake().await)?;
        check("spool()", self.gantry.spool(amount_secs, speed).await)?;
        check("cut_filament()", self.storage.cut_filament().await)?;
        check("pull_out()", self.storage.pull_out().await)?;
        check("retrieve_filament()", self.gantry.retrieve_filament().await)?;
        check("undock()", self.storage.undock().await)?;

        self.gantry.force_undocked();
        Ok(())
    }

    /// Feed filament from the gantry into the printer-side spool
    pub async fn load_printer_with_filament(&mut self) -> Result<(), ActionError> {
        tracing::info!("Workflow load_printer_with_filament started");

        let result = self.run_load_printer().await;
        Self::report("load_printer_with_filament", &result);
        result
    }

    async fn run_load_printer(&mut self) -> Result<(), ActionError> {
        check(
            "deliver_filament_until()",
            self.gantry.deliver_filament_until().await,
        )?;
        check("Proceed", self.gantry.proceed().await)?;

        let mut poller = Poller::new(
            self.workflow.poll_interval(),
            self.workflow.intake_poll_timeout(),
        );
        loop {
            let probe = self
                .printer_spool
                .wait_for_intake(INTAKE_SENSOR, DEFAULT_INTAKE_PROBE_TIMEOUT)
                .await;
            if check("wait_for_intake()", probe)? {
                break;
            }

            poller
                .wait()
                .await
                .map_err(|waited| ActionError::PollTimeout {
                    action: "wait_for_intake()".to_string(),
                    waited,
                })?;
            check("Proceed", self.gantry.proceed().await)?;
        }

        check(
            "stop()",
            self.gantry.stop("Filament delivery stopped").await,
        )?;

        let length = self.workflow.deliver_length_mm;
        check(
            &format!("deliver_filament({})", length),
            self.gantry.deliver_filament(length).await,
        )?;
        check(
            "intake_filament()",
            self.printer_spool.intake_filament().await,
        )?;
        check("unspool_tension()", self.gantry.unspool_tension(false).await)?;
        check(
            "spool_up_until(1)",
            self.printer_spool.spool_up_until(1).await,
        )?;
        check(
            "unspool_tension(true)",
            self.gantry.unspool_tension(true).await,
        )?;
        check(
            "stop()",
            self.printer_spool.stop("Spool operation complete.").await,
        )?;
        Ok(())
    }

    fn report(workflow: &str, result: &Result<(), ActionError>) {
        match result {
            Ok(()) => tracing::info!("Workflow {} complete", workflow),
            Err(e) => tracing::error!("Workflow {} aborted: {}", workflow, e),
        }
    }

    /// Release all three links
    pub async fn close(self) {
        if let Err(e) = self.gantry.close().await {
            tracing::warn!("Failed to close gantry link: {}", e);
        }
        if let Err(e) = self.storage.close().await {
            tracing::warn!("Failed to close storage link: {}", e);
        }
        if let Err(e) = self.printer_spool.close().await {
            tracing::warn!("Failed to close printer spool link: {}", e);
        }
    }
}
