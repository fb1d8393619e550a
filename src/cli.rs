//! Interface de linha de comando do FLOWGATE baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (sign, verify, urls,
//! backoff, demo) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// FLOWGATE: máquina de estados de flows com aprovações assinadas.
#[derive(Debug, Parser)]
#[command(name = "flowgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = flowgate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Assina um link de retomada.
    Sign {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        job: Uuid,
        #[arg(long, default_value_t = 0)]
        resume_id: u32,
        #[arg(long)]
        approver: Option<String>,
    },

    /// Verifica a assinatura de um link de retomada.
    Verify {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        job: Uuid,
        #[arg(long, default_value_t = 0)]
        resume_id: u32,
        #[arg(long)]
        approver: Option<String>,
        signature: String,
    },

    /// Gera os links resume/cancel/approvalPage de um job.
    Urls {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        job: Uuid,
        #[arg(long, default_value_t = 0)]
        resume_id: u32,
        #[arg(long)]
        approver: Option<String>,
    },

    /// Mostra o cronograma de backoff de uma política de retentativa.
    Backoff {
        /// Política em JSON, ex.: '{"constant":{"attempts":3,"seconds":5}}'.
        policy: String,
    },

    /// Executa a demonstração embutida: flow [a, b (suspend), c].
    Demo {
        /// Registra a aprovação no nível do flow antes de `b` suspender.
        #[arg(long, default_value_t = false)]
        pre_approve: bool,

        /// Aprovações exigidas pelo passo `b`.
        #[arg(long, default_value_t = 1)]
        required: u32,
    },
}
