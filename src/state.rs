//! Shared application state.
//!
//! One `AppState` per process, handed to every handler as `Arc<AppState>`.
//! World mutations happen under the write lock; `commit` flushes the rows
//! they touched before the lock is released.

use crate::error::AppError;
use crate::hub::Hub;
use crate::integrations::IntegrationRegistry;
use crate::notify::Notifier;
use crate::persist::SaveFile;
use crate::settings::Settings;
use crate::storage::FileStore;
use crate::world::World;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct AppState {
    pub world: RwLock<World>,
    pub save_file: SaveFile,
    pub hub: Hub,
    pub notifier: Notifier,
    pub files: Arc<dyn FileStore>,
    pub integrations: IntegrationRegistry,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// A panic while holding the lock leaves World consistent (every edit is
    /// applied whole), so a poisoned lock is simply taken over.
    pub fn read(&self) -> RwLockReadGuard<'_, World> {
        self.world.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, World> {
        self.world.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flush pending changes. A failure here fails the request.
    /// The rows are restored in memory when the flush fails, so World never
    /// holds a change the save file doesn't.
    pub fn commit(&self, world: &mut World) -> Result<(), AppError> {
        world
            .flush_with(|world, changes| {
                self.save_file.flush(world, changes).inspect_err(|e| {
                    tracing::error!(error = %e, rows = changes.len(), "save file flush failed, rolled back");
                })
            })
            .map_err(AppError::from)
    }

    /// Final save before the process exits: nobody stays online across a
    /// restart. Returns how many users were marked offline.
    pub fn shut_down(&self) -> Result<usize, AppError> {
        let online = {
            let mut world = self.write();
            let cleared = world.reset_presence();
            self.commit(&mut world)?;
            cleared
        };
        if online > 0 {
            self.hub.publish(crate::hub::ServerEvent::UsersOnline(Vec::new()));
        }
        Ok(online)
    }

    /// Flush pending changes made by a side effect. A failure is logged and
    /// the side effect undone.
    pub fn commit_side_effect(&self, world: &mut World, what: &str) {
        let flushed = world.flush_with(|world, changes| self.save_file.flush(world, changes));
        if let Err(e) = flushed {
            tracing::warn!(error = %e, side_effect = what, "save file flush failed, rolled back");
        }
    }
}

#[cfg(test)]
pub mod test_support {
    //! A full AppState over a throwaway save file, with mail captured in a
    //! channel instead of sent.

    use super::*;
    use crate::notify::{Mail, MailError, Mailer};
    use crate::persist::test_backend::FlakyDisk;
    use crate::storage::LocalFileStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    pub struct RecordingMailer(mpsc::UnboundedSender<Mail>);

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            let _ = self.0.send(mail.clone());
            Ok(())
        }
    }

    pub struct Harness {
        pub state: SharedState,
        pub mail: mpsc::UnboundedReceiver<Mail>,
        pub dir: TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let save_file = SaveFile::open(dir.path().join("tasks.redb")).expect("save file");
            Self::build(dir, save_file, |_, _| {})
        }

        /// Same as `new`, with `edit` applied to the default settings.
        pub fn with_settings(edit: impl FnOnce(&mut Settings, &Path)) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let save_file = SaveFile::open(dir.path().join("tasks.redb")).expect("save file");
            Self::build(dir, save_file, edit)
        }

        /// A harness whose save file starts refusing writes once the
        /// returned flag is set.
        pub fn with_flaky_disk() -> (Self, Arc<AtomicBool>) {
            let dir = tempfile::tempdir().expect("tempdir");
            let (disk, failing) = FlakyDisk::new();
            let save_file = SaveFile::with_backend(disk).expect("save file");
            (Self::build(dir, save_file, |_, _| {}), failing)
        }

        fn build(
            dir: TempDir,
            save_file: SaveFile,
            edit: impl FnOnce(&mut Settings, &Path),
        ) -> Self {
            let (tx, mail) = mpsc::unbounded_channel();
            let mut settings = Settings {
                client_url: "http://board.test".into(),
                ..Settings::default()
            };
            settings.storage.local_dir = dir.path().join("uploads").to_string_lossy().into_owned();
            edit(&mut settings, dir.path());
            let notifier = Notifier::new(
                Arc::new(RecordingMailer(tx)),
                settings.email.from.clone(),
                settings.client_url.clone(),
            );
            let state = Arc::new(AppState {
                world: RwLock::new(World::new()),
                save_file,
                hub: Hub::new(),
                notifier,
                files: Arc::new(LocalFileStore::new(dir.path().join("uploads"))),
                integrations: IntegrationRegistry::new(reqwest::Client::new()),
                settings,
            });
            Harness { state, mail, dir }
        }

        /// The next captured mail, if one arrives shortly.
        pub async fn next_mail(&mut self) -> Option<Mail> {
            tokio::time::timeout(Duration::from_millis(500), self.mail.recv())
                .await
                .ok()
                .flatten()
        }

        /// Nothing else was sent.
        pub async fn no_more_mail(&mut self) -> bool {
            self.next_mail().await.is_none()
        }
    }
}
