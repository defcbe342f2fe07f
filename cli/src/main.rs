//! Yomu 命令行工具
//!
//! 目前支持：
//! - `repo`：管理插件仓库配置（list/add/remove）
//! - `plugin`：插件分发（list/install/update/uninstall）
//! - `source`：驱动已安装插件的 Source 操作（popular/search/novel/chapters/text），
//!   结果以 JSON 打印到 stdout，状态信息走 stderr

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use yomu_core::app_paths;
use yomu_core::plugin::kv::PluginKeyValueStore;
use yomu_core::plugin::overrides::RuntimeOverrides;
use yomu_core::plugin::storage::FilePluginStorage;
use yomu_core::plugin::{PluginManager, PluginRepo};
use yomu_core::runtime::noop_emitter;
use yomu_core::source::SourceFactory;
use yomu_core::PluginError;

#[derive(Parser, Debug)]
#[command(name = "yomu-cli")]
#[command(version)]
#[command(about = "Yomu 命令行工具（插件分发与源调试）", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 插件仓库配置
    #[command(subcommand)]
    Repo(RepoCommands),

    /// 插件安装/更新/卸载
    #[command(subcommand)]
    Plugin(PluginCommands),

    /// 驱动插件源操作（调试用）
    #[command(subcommand)]
    Source(SourceCommands),
}

#[derive(Subcommand, Debug)]
enum RepoCommands {
    /// 列出已配置仓库
    List,
    /// 添加一个仓库
    Add(RepoAddArgs),
    /// 按 id 移除仓库
    Remove { id: String },
}

#[derive(Args, Debug)]
struct RepoAddArgs {
    /// 仓库 id（本地唯一）
    id: String,
    /// 索引地址（指向 .json 或追加 /plugins.min.json 的基地址）
    index_url: String,
    /// 展示名称；缺省用 id
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// 列出 installed/available/updates 三视图
    List,
    /// 按 id 安装（或更新到仓库里的版本）
    Install { id: String },
    /// 检查全部已安装插件的可用更新
    Update,
    /// 卸载
    Uninstall { id: String },
}

#[derive(Subcommand, Debug)]
enum SourceCommands {
    /// 热门列表
    Popular(SourceOpArgs),
    /// 搜索
    Search(SearchArgs),
    /// 书目详情（含章节列表）
    Novel(PathArgs),
    /// 章节列表
    Chapters(PathArgs),
    /// 章节正文
    Text(PathArgs),
}

#[derive(Args, Debug)]
struct SourceOpArgs {
    /// 插件 id
    plugin: String,
    /// 页码
    #[arg(long, default_value_t = 1)]
    page: i64,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// 插件 id
    plugin: String,
    /// 搜索词
    query: String,
    #[arg(long, default_value_t = 1)]
    page: i64,
}

#[derive(Args, Debug)]
struct PathArgs {
    /// 插件 id
    plugin: String,
    /// 站内路径（插件自己的 path 语义）
    path: String,
}

fn manager() -> PluginManager {
    PluginManager::new(
        app_paths::yomu_data_dir(),
        Arc::new(FilePluginStorage::in_data_dir()),
        noop_emitter(),
    )
}

fn source_factory() -> SourceFactory {
    SourceFactory::new(
        Arc::new(FilePluginStorage::in_data_dir()),
        Arc::new(load_overrides()),
        Arc::new(PluginKeyValueStore::in_data_dir()),
        noop_emitter(),
    )
}

/// 覆写配置：数据目录下的 runtime_overrides.json，缺失/损坏都退到空集合
fn load_overrides() -> RuntimeOverrides {
    let path = app_paths::yomu_data_dir().join("runtime_overrides.json");
    let payload = std::fs::read_to_string(path).ok();
    RuntimeOverrides::from_json(payload.as_deref())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), PluginError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PluginError::Storage(format!("serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn run(cli: Cli) -> Result<(), PluginError> {
    match cli.command {
        Commands::Repo(cmd) => {
            let manager = manager();
            match cmd {
                RepoCommands::List => print_json(&manager.load_repos()?)?,
                RepoCommands::Add(args) => {
                    let mut repos = manager.load_repos()?;
                    if repos.iter().any(|r| r.id == args.id) {
                        return Err(PluginError::Storage(format!(
                            "repo '{}' already exists",
                            args.id
                        )));
                    }
                    repos.push(PluginRepo {
                        name: args.name.unwrap_or_else(|| args.id.clone()),
                        id: args.id,
                        index_url: args.index_url,
                    });
                    manager.save_repos(&repos)?;
                    eprintln!("仓库已添加（{} 个）", repos.len());
                }
                RepoCommands::Remove { id } => {
                    let mut repos = manager.load_repos()?;
                    let before = repos.len();
                    repos.retain(|r| r.id != id);
                    if repos.len() == before {
                        return Err(PluginError::Storage(format!("repo '{}' not found", id)));
                    }
                    manager.save_repos(&repos)?;
                    eprintln!("仓库已移除");
                }
            }
        }
        Commands::Plugin(cmd) => {
            let manager = manager();
            match cmd {
                PluginCommands::List => print_json(&manager.fetch_listing()?)?,
                PluginCommands::Install { id } => {
                    let pkg = manager.install_by_id(&id)?;
                    eprintln!(
                        "已安装 {} v{}（{} 字节）",
                        pkg.entry.id,
                        pkg.entry.version,
                        pkg.script.len()
                    );
                }
                PluginCommands::Update => print_json(&manager.find_updates()?)?,
                PluginCommands::Uninstall { id } => {
                    if manager.uninstall(&id)? {
                        eprintln!("已卸载 {}", id);
                    } else {
                        return Err(PluginError::ScriptNotFound(id));
                    }
                }
            }
        }
        Commands::Source(cmd) => {
            let factory = source_factory();
            match cmd {
                SourceCommands::Popular(args) => {
                    let mut source = factory.create(&args.plugin)?;
                    print_json(&source.popular(args.page)?)?;
                }
                SourceCommands::Search(args) => {
                    let mut source = factory.create(&args.plugin)?;
                    print_json(&source.search(&args.query, &[], args.page)?)?;
                }
                SourceCommands::Novel(args) => {
                    let mut source = factory.create(&args.plugin)?;
                    print_json(&source.parse_novel(&args.path)?)?;
                }
                SourceCommands::Chapters(args) => {
                    let mut source = factory.create(&args.plugin)?;
                    print_json(&source.parse_chapter_list(&args.path)?)?;
                }
                SourceCommands::Text(args) => {
                    let mut source = factory.create(&args.plugin)?;
                    println!("{}", source.parse_chapter_text(&args.path)?);
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("错误：{}", e);
            ExitCode::FAILURE
        }
    }
}
