//! Interface de terminal do FLOWGATE: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`FlowProgress`] acompanha visualmente
//! a execução de um flow no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use flowgate::state_machine::{FlowStatus, JobOutcome, Transition};

/// Indicador visual de progresso para a execução de um flow no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e espera (amarelo).
pub struct FlowProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl FlowProgress {
    /// Inicia o spinner com a descrição do flow.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("START: {description}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Imprime uma linha por transição e atualiza a mensagem do spinner.
    pub fn transitions(&self, transitions: &[Transition]) {
        for transition in transitions {
            self.transition(transition);
        }
    }

    fn transition(&self, transition: &Transition) {
        let line = match transition {
            Transition::Dispatched { module, job } => {
                format!("  {} {module} dispatched as {job}", self.dim.apply_to("→"))
            }
            Transition::Started { module, .. } => {
                self.pb.set_message(format!("RUNNING: {module}"));
                format!("  {} {module} running", self.dim.apply_to("▶"))
            }
            Transition::Suspended {
                module, remaining, ..
            } => {
                self.pb.set_message(format!("WAITING: {module}"));
                format!(
                    "  {} {module} waiting for {remaining} approval(s)",
                    self.yellow.apply_to("⏸")
                )
            }
            Transition::Resumed {
                module, approvers, ..
            } => format!(
                "  {} {module} resumed with {approvers} approver(s)",
                self.green.apply_to("▶")
            ),
            Transition::Retry { module, delay, .. } => format!(
                "  {} {module} retry in {:.1}s",
                self.yellow.apply_to("↻"),
                delay.as_secs_f64()
            ),
            Transition::ModuleFailed { module, reason } => {
                format!("  {} {module} failed: {reason}", self.red.apply_to("✗"))
            }
            Transition::Canceled => format!("  {} flow canceled", self.red.apply_to("■")),
            Transition::Updated | Transition::Completed(_) => return,
        };
        self.pb.println(line);
    }

    /// Finaliza o spinner e exibe o resultado final do flow.
    pub fn complete(&self, outcome: &JobOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            JobOutcome::Success => {
                println!("  {} Flow completed successfully", self.green.apply_to("✓"));
            }
            JobOutcome::Failure(reason) => {
                println!("  {} Flow failed: {reason}", self.red.apply_to("✗"));
            }
            JobOutcome::Canceled => {
                println!("  {} Flow canceled", self.yellow.apply_to("■"));
            }
        }
    }

    /// Imprime o status do flow formatado em JSON.
    pub fn print_status(&self, status: &FlowStatus) {
        println!();
        println!("{}", self.dim.apply_to("─── Flow Status ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(status).unwrap_or_default()
        );
    }
}
