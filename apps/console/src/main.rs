use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use client_core::{
    config::load_settings,
    coordinator::{Confirmation, CoordinatorError, EntityRef, Operation},
    gateway::ImportFile,
    session::FileCredentialStore,
    Console,
};
use serde::Serialize;
use shared::{
    domain::{CampaignId, ListId, SmtpConfigId, SubscriberId, TemplateId},
    protocol::{
        CampaignDraft, ListDraft, RegisterRequest, SmtpConfigDraft, SubscriberDraft,
        SubscriberPatch, TemplateDraft, DEFAULT_SMTP_PORT,
    },
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Operator console for the email campaign service")]
struct Cli {
    /// Overrides the configured service base URL.
    #[arg(long)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    Register {
        username: String,
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    Logout,
    Dashboard,
    #[command(subcommand)]
    Campaigns(CampaignCommand),
    #[command(subcommand)]
    Lists(ListCommand),
    #[command(subcommand)]
    Subscribers(SubscriberCommand),
    #[command(subcommand)]
    Templates(TemplateCommand),
    #[command(subcommand)]
    Smtp(SmtpCommand),
}

#[derive(Subcommand, Debug)]
enum CampaignCommand {
    List,
    Create {
        name: String,
        subject: String,
        #[arg(long)]
        smtp: i64,
        #[arg(long)]
        template: Option<i64>,
        /// Subscriber list to target; repeat for several.
        #[arg(long = "list")]
        lists: Vec<i64>,
        /// RFC 3339 timestamp; must be in the future.
        #[arg(long)]
        schedule: Option<DateTime<Utc>>,
    },
    Send {
        id: i64,
    },
    Delete {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ListCommand {
    List,
    Create {
        name: String,
        /// Spreadsheet to import into the new list.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Rename {
        id: i64,
        name: String,
    },
    Delete {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
    Import {
        id: i64,
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriberCommand {
    List {
        list_id: i64,
    },
    Add {
        list_id: i64,
        email: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    Edit {
        id: i64,
        list_id: i64,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    Remove {
        id: i64,
        list_id: i64,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    List,
    Create {
        name: String,
        html_file: PathBuf,
    },
    Update {
        id: i64,
        name: String,
        html_file: PathBuf,
    },
    Delete {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct SmtpFields {
    name: String,
    host: String,
    username: String,
    from_email: String,
    #[arg(long, default_value_t = DEFAULT_SMTP_PORT)]
    port: u16,
    /// Left out of updates when not given, keeping the stored password.
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    no_tls: bool,
    #[arg(long)]
    ssl: bool,
}

impl SmtpFields {
    fn into_draft(self) -> SmtpConfigDraft {
        let mut draft = SmtpConfigDraft::new(self.name, self.host, self.username, self.from_email);
        draft.port = self.port;
        draft.use_tls = !self.no_tls;
        draft.use_ssl = self.ssl;
        draft.password = self.password;
        draft
    }
}

#[derive(Subcommand, Debug)]
enum SmtpCommand {
    List,
    Create(SmtpFields),
    Update {
        id: i64,
        #[command(flatten)]
        fields: SmtpFields,
    },
    Delete {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn confirmation(yes: bool, target: EntityRef) -> Option<Confirmation> {
    yes.then(|| Confirmation::confirm(target))
}

async fn import_file(path: &Path) -> Result<ImportFile> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read import file '{}'", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "import.csv".to_string());
    Ok(ImportFile::new(filename, content))
}

async fn read_html(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read template '{}'", path.display()))
}

async fn execute(console: &Console, operation: Operation) -> Result<()> {
    match console.execute(operation).await {
        Ok(completed) => {
            if let Some(created) = completed.created {
                println!("created {created}");
            }
            if let Some(imported) = completed.imported {
                println!("imported {imported} subscribers");
            }
            println!("done");
            Ok(())
        }
        Err(CoordinatorError::ConfirmationRequired(target)) => {
            bail!("refusing to delete {target} without --yes")
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_campaigns(console: &Console, command: CampaignCommand) -> Result<()> {
    match command {
        CampaignCommand::List => print_json(&console.campaigns().load().await?),
        CampaignCommand::Create {
            name,
            subject,
            smtp,
            template,
            lists,
            schedule,
        } => {
            let draft = CampaignDraft {
                name,
                subject,
                template_id: template.map(TemplateId),
                subscriber_list_ids: lists.into_iter().map(ListId).collect(),
                smtp_config_id: SmtpConfigId(smtp),
                scheduled_at: schedule,
            };
            execute(console, Operation::CreateCampaign(draft)).await
        }
        CampaignCommand::Send { id } => {
            let campaigns = console.campaigns();
            campaigns.load().await?;
            execute(console, Operation::SendCampaign { id: CampaignId(id) }).await?;
            if let Some(campaign) = campaigns
                .snapshot()
                .and_then(|snapshot| snapshot.items.into_iter().find(|c| c.id == CampaignId(id)))
            {
                println!("campaign {id} is now {}", campaign.status);
            }
            Ok(())
        }
        CampaignCommand::Delete { id, yes } => {
            let id = CampaignId(id);
            let confirmation = confirmation(yes, EntityRef::Campaign(id));
            execute(console, Operation::DeleteCampaign { id, confirmation }).await
        }
    }
}

async fn run_lists(console: &Console, command: ListCommand) -> Result<()> {
    match command {
        ListCommand::List => print_json(&console.subscriber_lists().load().await?),
        ListCommand::Create { name, file } => {
            let attachment = match file {
                Some(path) => Some(import_file(&path).await?),
                None => None,
            };
            execute(
                console,
                Operation::CreateList {
                    draft: ListDraft { name },
                    attachment,
                },
            )
            .await
        }
        ListCommand::Rename { id, name } => {
            execute(
                console,
                Operation::RenameList {
                    id: ListId(id),
                    draft: ListDraft { name },
                },
            )
            .await
        }
        ListCommand::Delete { id, yes } => {
            let id = ListId(id);
            let confirmation = confirmation(yes, EntityRef::SubscriberList(id));
            execute(console, Operation::DeleteList { id, confirmation }).await
        }
        ListCommand::Import { id, file } => {
            let file = import_file(&file).await?;
            execute(
                console,
                Operation::ImportSubscribers {
                    list_id: ListId(id),
                    file,
                },
            )
            .await
        }
    }
}

async fn run_subscribers(console: &Console, command: SubscriberCommand) -> Result<()> {
    match command {
        SubscriberCommand::List { list_id } => {
            print_json(&console.subscribers(ListId(list_id)).load().await?)
        }
        SubscriberCommand::Add {
            list_id,
            email,
            first_name,
            last_name,
        } => {
            let draft = SubscriberDraft {
                email,
                first_name,
                last_name,
                subscriber_list_id: ListId(list_id),
            };
            execute(console, Operation::AddSubscriber(draft)).await
        }
        SubscriberCommand::Edit {
            id,
            list_id,
            email,
            first_name,
            last_name,
        } => {
            let patch = SubscriberPatch {
                email,
                first_name,
                last_name,
            };
            execute(
                console,
                Operation::UpdateSubscriber {
                    id: SubscriberId(id),
                    list_id: ListId(list_id),
                    patch,
                },
            )
            .await
        }
        SubscriberCommand::Remove { id, list_id, yes } => {
            let id = SubscriberId(id);
            let confirmation = confirmation(yes, EntityRef::Subscriber(id));
            execute(
                console,
                Operation::RemoveSubscriber {
                    id,
                    list_id: ListId(list_id),
                    confirmation,
                },
            )
            .await
        }
    }
}

async fn run_templates(console: &Console, command: TemplateCommand) -> Result<()> {
    match command {
        TemplateCommand::List => print_json(&console.templates().load().await?),
        TemplateCommand::Create { name, html_file } => {
            let html_content = read_html(&html_file).await?;
            execute(
                console,
                Operation::CreateTemplate(TemplateDraft { name, html_content }),
            )
            .await
        }
        TemplateCommand::Update {
            id,
            name,
            html_file,
        } => {
            let html_content = read_html(&html_file).await?;
            execute(
                console,
                Operation::UpdateTemplate {
                    id: TemplateId(id),
                    draft: TemplateDraft { name, html_content },
                },
            )
            .await
        }
        TemplateCommand::Delete { id, yes } => {
            let id = TemplateId(id);
            let confirmation = confirmation(yes, EntityRef::Template(id));
            execute(console, Operation::DeleteTemplate { id, confirmation }).await
        }
    }
}

async fn run_smtp(console: &Console, command: SmtpCommand) -> Result<()> {
    match command {
        SmtpCommand::List => print_json(&console.smtp_configs().load().await?),
        SmtpCommand::Create(fields) => {
            execute(console, Operation::CreateSmtpConfig(fields.into_draft())).await
        }
        SmtpCommand::Update { id, fields } => {
            execute(
                console,
                Operation::UpdateSmtpConfig {
                    id: SmtpConfigId(id),
                    draft: fields.into_draft(),
                },
            )
            .await
        }
        SmtpCommand::Delete { id, yes } => {
            let id = SmtpConfigId(id);
            let confirmation = confirmation(yes, EntityRef::SmtpConfig(id));
            execute(console, Operation::DeleteSmtpConfig { id, confirmation }).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    let store = Arc::new(FileCredentialStore::new(settings.credentials_path.clone()));
    let console = Console::new(&settings, store)?;
    info!(api_base_url = %settings.api_base_url, "console: starting");

    match cli.command {
        Command::Login { username, password } => {
            let claims = console.login(&username, &password).await?;
            println!("logged in as user_id={}", claims.user_id);
            Ok(())
        }
        Command::Register {
            username,
            email,
            password,
            first_name,
            last_name,
        } => {
            let request = RegisterRequest {
                username,
                email,
                password,
                first_name,
                last_name,
            };
            match console.register(&request).await? {
                Some(claims) => println!("registered and logged in as user_id={}", claims.user_id),
                None => println!("registered; log in to continue"),
            }
            Ok(())
        }
        Command::Logout => {
            console.restore_session().await;
            console.logout().await;
            println!("logged out");
            Ok(())
        }
        command => {
            if console.restore_session().await.is_none() {
                bail!("not logged in; run `console login <username> --password <password>` first");
            }
            run_session_command(&console, command).await
        }
    }
}

async fn run_session_command(console: &Console, command: Command) -> Result<()> {
    match command {
        Command::Dashboard => print_json(&console.dashboard().await?),
        Command::Campaigns(command) => run_campaigns(console, command).await,
        Command::Lists(command) => run_lists(console, command).await,
        Command::Subscribers(command) => run_subscribers(console, command).await,
        Command::Templates(command) => run_templates(console, command).await,
        Command::Smtp(command) => run_smtp(console, command).await,
        Command::Login { .. } | Command::Register { .. } | Command::Logout => {
            bail!("session commands are handled before restoring a session")
        }
    }
}
