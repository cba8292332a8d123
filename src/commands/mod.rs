pub mod common;
pub mod metabolomics;
pub mod ngs;
pub mod proteomics;

use anyhow::Result;
use clap::Subcommand;
use common::CommonArgs;

/// 支持的同步命令
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// 同步测序仪的运行目录
    Ngs(ngs::NgsArgs),
    /// 同步蛋白组项目目录
    Proteomics(proteomics::ProteomicsArgs),
    /// 同步代谢组数据集
    Metabolomics(metabolomics::MetabolomicsArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ngs(_) => ngs::COMMAND,
            Command::Proteomics(_) => proteomics::COMMAND,
            Command::Metabolomics(_) => metabolomics::COMMAND,
        }
    }

    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Ngs(args) => &args.common,
            Command::Proteomics(args) => &args.common,
            Command::Metabolomics(args) => &args.common,
        }
    }

    pub async fn run(&self) -> Result<()> {
        match self {
            Command::Ngs(args) => ngs::run(args).await,
            Command::Proteomics(args) => proteomics::run(args).await,
            Command::Metabolomics(args) => metabolomics::run(args).await,
        }
    }
}
