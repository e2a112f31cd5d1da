//! Load/commit adapter around the placement engine.
//!
//! A `BatchSession` is built from the items fetched for one batch, accepts
//! editing operations, and turns the moved set into a minimal list of
//! coordinate updates on commit. I/O only happens through the `ItemSource`
//! and `ItemSink` collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::coordinates::{CellCoordinate, CoordinateKey, FillMode, RowLabeler};
use crate::engine::{CommitPolicy, MoveReport, PlacementConfig, PlacementEngine, PlacementEvent};
use crate::error::{SaveError, SessionError, SourceError};
use crate::grid::GridState;
use crate::model::{
    BatchId, GridDimensions, Item, ItemId, ItemUpdate, PersistedCoordinate, ValidationError,
};

/// Supplies all items of a batch.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch_items(&self, batch: &BatchId) -> Result<Vec<Item>, SourceError>;
}

/// Persists coordinate changes.
#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn save(&self, batch: &BatchId, changes: &[ItemUpdate]) -> Result<(), SaveError>;
}

/// Why a persisted coordinate was not honoured on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum LoadIssue {
    /// Only one of row/column is set.
    PartialCoordinate,
    UnknownRowLabel { row: String },
    OutsidePlate { row: String, column: u32 },
    WellTaken { well: String },
    /// The id was already loaded; the duplicate is dropped.
    DuplicateId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct RejectedCoordinate {
    pub id: ItemId,
    #[serde(flatten)]
    pub issue: LoadIssue,
}

/// Summary of a load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub placed: usize,
    pub unplaced: usize,
    pub rejected: Vec<RejectedCoordinate>,
}

impl LoadReport {
    fn reject(&mut self, id: &ItemId, issue: LoadIssue) {
        warn!(item = %id, ?issue, "ignoring persisted coordinate");
        self.rejected.push(RejectedCoordinate {
            id: id.clone(),
            issue,
        });
    }
}

/// Partitions fetched items into placed and unplaced.
///
/// Items with both coordinates land on their well; everything else, including
/// malformed or conflicting coordinates, starts in the pool. The moved set is
/// empty.
pub fn load_grid(items: Vec<Item>, dims: GridDimensions, config: &PlacementConfig) -> (GridState, LoadReport) {
    let mut grid = GridState::new(dims);
    let mut report = LoadReport::default();

    for item in items {
        if grid.contains(&item.id) {
            report.reject(&item.id, LoadIssue::DuplicateId);
            continue;
        }

        let target = match item.persisted_coordinate() {
            PersistedCoordinate::Unplaced => None,
            PersistedCoordinate::Partial => {
                report.reject(&item.id, LoadIssue::PartialCoordinate);
                None
            }
            PersistedCoordinate::Placed { row, column } => match config.row_labels.parse(row) {
                None => {
                    report.reject(&item.id, LoadIssue::UnknownRowLabel { row: row.to_owned() });
                    None
                }
                Some(row_index) => {
                    let coord = CellCoordinate::new(row_index, column);
                    if coord.is_within(&dims) {
                        Some(coord)
                    } else {
                        report.reject(
                            &item.id,
                            LoadIssue::OutsidePlate {
                                row: row.to_owned(),
                                column,
                            },
                        );
                        None
                    }
                }
            },
        };

        match target {
            Some(coord) => match grid.insert_placed(item, coord) {
                Ok(()) => report.placed += 1,
                Err(item) => {
                    let well = CoordinateKey::new(coord, &config.row_labels)
                        .map(|key| key.to_string())
                        .unwrap_or_default();
                    report.reject(&item.id, LoadIssue::WellTaken { well });
                    grid.insert_available(item);
                    report.unplaced += 1;
                }
            },
            None => {
                grid.insert_available(item);
                report.unplaced += 1;
            }
        }
    }

    (grid, report)
}

/// Coordinate updates for the moved items, honouring the commit policy.
pub fn pending_changes(grid: &GridState, config: &PlacementConfig) -> Vec<ItemUpdate> {
    grid.moved()
        .iter()
        .filter_map(|id| {
            let item = grid.item(id)?;
            let current = grid.coordinate_of(id);
            if config.commit_policy == CommitPolicy::Changed
                && persisted_cell(item, config) == Some(current)
            {
                return None;
            }
            Some(ItemUpdate {
                id: id.clone(),
                row_coordinate: current.and_then(|coord| config.row_labels.label(coord.row)),
                column_coordinate: current.map(|coord| coord.column),
            })
        })
        .collect()
}

/// The loaded well of an item: `Some(None)` for unplaced, `None` when the
/// stored value is unusable and must be rewritten.
fn persisted_cell(item: &Item, config: &PlacementConfig) -> Option<Option<CellCoordinate>> {
    match item.persisted_coordinate() {
        PersistedCoordinate::Unplaced => Some(None),
        PersistedCoordinate::Partial => None,
        PersistedCoordinate::Placed { row, column } => config
            .row_labels
            .parse(row)
            .map(|row| Some(CellCoordinate::new(row, column))),
    }
}

/// Changes captured at the start of a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommit {
    pub batch_id: BatchId,
    pub updates: Vec<ItemUpdate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    #[serde(rename_all = "camelCase")]
    Saved {
        saved: usize,
        reload_token: u64,
        reloaded: bool,
    },
    /// The moved set produced no updates; nothing was sent.
    NothingToSave,
    /// Another commit is still running; this request was ignored.
    AlreadySubmitting,
}

/// Editing session for one batch.
#[derive(Clone, Debug)]
pub struct BatchSession {
    batch_id: BatchId,
    engine: PlacementEngine,
    submitting: bool,
    reload_token: u64,
    last_load: LoadReport,
}

impl BatchSession {
    /// Builds a session from already fetched items.
    pub fn from_items(
        batch_id: BatchId,
        items: Vec<Item>,
        dims: GridDimensions,
        config: PlacementConfig,
    ) -> Result<Self, ValidationError> {
        let dims = dims.validated()?;
        config.validate_for(&dims)?;
        let (grid, last_load) = load_grid(items, dims, &config);
        let engine = PlacementEngine::from_grid(grid, config)?;
        info!(
            batch = %batch_id,
            placed = last_load.placed,
            unplaced = last_load.unplaced,
            "batch loaded"
        );
        Ok(Self {
            batch_id,
            engine,
            submitting: false,
            reload_token: 0,
            last_load,
        })
    }

    /// Fetches the batch and builds a session.
    pub async fn open<S: ItemSource + ?Sized>(
        source: &S,
        batch_id: BatchId,
        dims: GridDimensions,
        config: PlacementConfig,
    ) -> Result<Self, SessionError> {
        let dims = dims.validated()?;
        config.validate_for(&dims)?;
        let items = source.fetch_items(&batch_id).await?;
        Ok(Self::from_items(batch_id, items, dims, config)?)
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn engine(&self) -> &PlacementEngine {
        &self.engine
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    /// Incremented after every successful save.
    pub fn reload_token(&self) -> u64 {
        self.reload_token
    }

    pub fn last_load(&self) -> &LoadReport {
        &self.last_load
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.submitting {
            return Err(SessionError::CommitInFlight);
        }
        Ok(())
    }

    /// Parses a well key with this plate's row labels.
    ///
    /// Wells beyond the plate parse fine; a move onto them overflows.
    pub fn resolve_key(&self, key: &CoordinateKey) -> Result<CellCoordinate, SessionError> {
        key.to_cell(&self.engine.config().row_labels)
            .ok_or_else(|| SessionError::MalformedWell(key.to_string()))
    }

    pub fn move_items(
        &mut self,
        items: &[ItemId],
        target: Option<CellCoordinate>,
    ) -> Result<MoveReport, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.move_items(items, target))
    }

    pub fn on_grid_drop(&mut self, item: &ItemId, coord: CellCoordinate) -> Result<MoveReport, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.on_grid_drop(item, coord))
    }

    pub fn on_list_drop(&mut self, item: &ItemId) -> Result<MoveReport, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.on_list_drop(item))
    }

    pub fn on_item_click(&mut self, item: &ItemId, shift: bool) -> Result<bool, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.on_item_click(item, shift))
    }

    pub fn clear_grid(&mut self) -> Result<MoveReport, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.clear_grid())
    }

    /// Full relayout; `natural_order` sorts by item name first.
    pub fn move_all(&mut self, natural_order: bool) -> Result<MoveReport, SessionError> {
        self.ensure_idle()?;
        Ok(if natural_order {
            self.engine.move_all_natural()
        } else {
            self.engine.move_all()
        })
    }

    pub fn set_fill_mode(&mut self, mode: FillMode) -> Result<PlacementEvent, SessionError> {
        self.ensure_idle()?;
        Ok(self.engine.set_fill_mode(mode))
    }

    /// Updates a commit would send right now.
    pub fn pending_changes(&self) -> Vec<ItemUpdate> {
        pending_changes(self.engine.grid(), self.engine.config())
    }

    /// Replaces the plate wholesale with freshly fetched items.
    ///
    /// The active fill mode survives; selection and moved set do not.
    pub fn replace_items(&mut self, items: Vec<Item>) -> &LoadReport {
        let config = *self.engine.config();
        let (grid, report) = load_grid(items, self.engine.grid().dims(), &config);
        self.engine.replace_grid(grid);
        self.last_load = report;
        &self.last_load
    }

    /// Refetches the batch and replaces the plate.
    pub async fn reload<S: ItemSource + ?Sized>(&mut self, source: &S) -> Result<&LoadReport, SessionError> {
        self.ensure_idle()?;
        let items = source.fetch_items(&self.batch_id).await?;
        Ok(self.replace_items(items))
    }

    /// Captures the diff and raises the submitting flag.
    ///
    /// Returns `None` if a commit is already running.
    pub fn begin_commit(&mut self) -> Option<PendingCommit> {
        if self.submitting {
            return None;
        }
        self.submitting = true;
        Some(PendingCommit {
            batch_id: self.batch_id.clone(),
            updates: self.pending_changes(),
        })
    }

    /// Applies the save result and lowers the submitting flag.
    ///
    /// On failure the moved set is left untouched so a retry resends the same
    /// diff.
    pub fn finish_commit(
        &mut self,
        pending: PendingCommit,
        saved: Result<(), SaveError>,
    ) -> Result<CommitOutcome, SessionError> {
        self.submitting = false;
        if let Err(err) = saved {
            warn!(batch = %self.batch_id, error = %err, "save failed; keeping moved items for retry");
            return Err(SessionError::Save(err));
        }

        let grid = self.engine.grid_mut();
        grid.rebase(&pending.updates);
        grid.clear_moved();

        if pending.updates.is_empty() {
            return Ok(CommitOutcome::NothingToSave);
        }

        self.reload_token += 1;
        info!(
            batch = %self.batch_id,
            saved = pending.updates.len(),
            reload_token = self.reload_token,
            "coordinates saved"
        );
        Ok(CommitOutcome::Saved {
            saved: pending.updates.len(),
            reload_token: self.reload_token,
            reloaded: false,
        })
    }

    fn complete_commit(
        &mut self,
        pending: PendingCommit,
        saved: Result<(), SaveError>,
        fresh: Option<Result<Vec<Item>, SourceError>>,
    ) -> Result<CommitOutcome, SessionError> {
        let mut outcome = self.finish_commit(pending, saved)?;
        if let (CommitOutcome::Saved { reloaded, .. }, Some(fresh)) = (&mut outcome, fresh) {
            match fresh {
                Ok(items) => {
                    self.replace_items(items);
                    *reloaded = true;
                }
                Err(err) => {
                    warn!(batch = %self.batch_id, error = %err, "reload after save failed; keeping local state");
                }
            }
        }
        Ok(outcome)
    }

    /// Saves the pending changes and reloads the batch.
    ///
    /// Dropping the returned future clears the submitting flag and keeps the
    /// local changes pending.
    pub async fn commit<K, S>(&mut self, sink: &K, source: &S) -> Result<CommitOutcome, SessionError>
    where
        K: ItemSink + ?Sized,
        S: ItemSource + ?Sized,
    {
        let Some(pending) = self.begin_commit() else {
            return Ok(CommitOutcome::AlreadySubmitting);
        };
        if pending.updates.is_empty() {
            return self.finish_commit(pending, Ok(()));
        }
        let mut guard = SubmittingGuard { session: self };
        let saved = sink.save(&pending.batch_id, &pending.updates).await;
        let fresh = match saved {
            Ok(()) => Some(source.fetch_items(&pending.batch_id).await),
            Err(_) => None,
        };
        guard.session.complete_commit(pending, saved, fresh)
    }

    fn abort_commit(&mut self) {
        if self.submitting {
            warn!(batch = %self.batch_id, "commit aborted; changes stay pending");
            self.submitting = false;
        }
    }
}

/// Clears the submitting flag when a commit is cut off mid-flight.
struct SubmittingGuard<'a> {
    session: &'a mut BatchSession,
}

impl Drop for SubmittingGuard<'_> {
    fn drop(&mut self) {
        self.session.abort_commit();
    }
}

/// Commit for a session shared behind a mutex.
///
/// The save and the reload run on their own task, so the commit finishes
/// even when the caller goes away. The lock is released while they are
/// awaited; the submitting flag keeps other writers out in the meantime.
pub async fn commit_shared<R>(
    session: Arc<Mutex<BatchSession>>,
    repository: Arc<R>,
) -> Result<CommitOutcome, SessionError>
where
    R: ItemSource + ItemSink + ?Sized + 'static,
{
    let pending = {
        let mut guard = session.lock().await;
        match guard.begin_commit() {
            Some(pending) if pending.updates.is_empty() => {
                return guard.finish_commit(pending, Ok(()));
            }
            Some(pending) => pending,
            None => return Ok(CommitOutcome::AlreadySubmitting),
        }
    };

    let task = tokio::spawn(save_and_reload(session.clone(), repository, pending));
    match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            session.lock().await.abort_commit();
            Err(SessionError::CommitAborted(err.to_string()))
        }
    }
}

async fn save_and_reload<R>(
    session: Arc<Mutex<BatchSession>>,
    repository: Arc<R>,
    pending: PendingCommit,
) -> Result<CommitOutcome, SessionError>
where
    R: ItemSource + ItemSink + ?Sized,
{
    let saved = repository.save(&pending.batch_id, &pending.updates).await;
    let fresh = match saved {
        Ok(()) => Some(repository.fetch_items(&pending.batch_id).await),
        Err(_) => None,
    };
    session.lock().await.complete_commit(pending, saved, fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryRepository;
    use crate::coordinates::RowLabelScheme;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn plate() -> GridDimensions {
        GridDimensions::new(8, 12).unwrap()
    }

    fn batch() -> BatchId {
        BatchId::new("batch-1")
    }

    fn ids(raw: &[&str]) -> Vec<ItemId> {
        raw.iter().map(|id| ItemId::from(*id)).collect()
    }

    fn session(items: Vec<Item>, config: PlacementConfig) -> BatchSession {
        BatchSession::from_items(batch(), items, plate(), config).unwrap()
    }

    #[test]
    fn load_partitions_by_persisted_coordinates() {
        let session = session(
            vec![Item::unplaced("A1"), Item::placed("A2", "A", 1)],
            PlacementConfig::default(),
        );
        let grid = session.engine().grid();

        assert_eq!(grid.available(), &ids(&["A1"])[..]);
        assert_eq!(grid.occupant(CellCoordinate::new(1, 1)), Some(&ItemId::from("A2")));
        assert!(grid.moved().is_empty());
        assert_eq!(session.last_load().placed, 1);
        assert_eq!(session.last_load().unplaced, 1);
    }

    #[test]
    fn load_treats_malformed_coordinates_as_unplaced() {
        let mut partial = Item::unplaced("partial");
        partial.row_coordinate = Some("B".into());
        let items = vec![
            partial,
            Item::placed("bad-row", "7", 1),
            Item::placed("outside", "J", 1),
            Item::placed("first", "C", 3),
            Item::placed("second", "C", 3),
            Item::unplaced("first"),
        ];

        let (grid, report) = load_grid(items, plate(), &PlacementConfig::default());

        assert_eq!(grid.placed_count(), 1);
        assert_eq!(grid.available(), &ids(&["partial", "bad-row", "outside", "second"])[..]);
        let issues: Vec<_> = report.rejected.iter().map(|r| r.issue.clone()).collect();
        assert_eq!(
            issues,
            vec![
                LoadIssue::PartialCoordinate,
                LoadIssue::UnknownRowLabel { row: "7".into() },
                LoadIssue::OutsidePlate { row: "J".into(), column: 1 },
                LoadIssue::WellTaken { well: "C_3".into() },
                LoadIssue::DuplicateId,
            ]
        );
        grid.check_invariants().unwrap();
    }

    #[test]
    fn changed_policy_skips_items_that_returned_home() {
        let mut session = session(
            vec![Item::unplaced("A1"), Item::placed("A2", "A", 1)],
            PlacementConfig::default(),
        );
        session.move_items(&ids(&["A1"]), Some(CellCoordinate::new(1, 1))).unwrap();
        session.move_items(&ids(&["A2"]), Some(CellCoordinate::new(1, 1))).unwrap();

        // A2 is back on A_1, A1 got displaced back to the pool
        assert_eq!(session.engine().grid().moved().len(), 2);
        assert!(session.pending_changes().is_empty());
    }

    #[test]
    fn touched_policy_sends_every_moved_item() {
        let config = PlacementConfig::builder()
            .commit_policy(CommitPolicy::Touched)
            .build();
        let mut session = session(vec![Item::placed("A2", "A", 1)], config);
        session.on_list_drop(&"A2".into()).unwrap();
        session.move_items(&ids(&["A2"]), Some(CellCoordinate::new(1, 1))).unwrap();

        let changes = session.pending_changes();
        assert_eq!(
            changes,
            vec![ItemUpdate {
                id: "A2".into(),
                row_coordinate: Some("A".into()),
                column_coordinate: Some(1),
            }]
        );
    }

    #[test]
    fn pending_changes_carry_current_coordinates() {
        let mut session = session(
            vec![Item::unplaced("A1"), Item::placed("A2", "A", 1)],
            PlacementConfig::default(),
        );
        session.move_items(&ids(&["A1"]), Some(CellCoordinate::new(1, 1))).unwrap();

        let changes = session.pending_changes();
        assert_eq!(
            changes,
            vec![
                ItemUpdate {
                    id: "A2".into(),
                    row_coordinate: None,
                    column_coordinate: None,
                },
                ItemUpdate {
                    id: "A1".into(),
                    row_coordinate: Some("A".into()),
                    column_coordinate: Some(1),
                },
            ]
        );
    }

    #[test]
    fn partial_coordinates_are_rewritten_on_commit_when_touched() {
        let mut partial = Item::unplaced("p");
        partial.column_coordinate = Some(5);
        let mut session = session(vec![partial], PlacementConfig::default());
        session.on_grid_drop(&"p".into(), CellCoordinate::new(2, 2)).unwrap();
        session.on_list_drop(&"p".into()).unwrap();

        let changes = session.pending_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].column_coordinate, None);
    }

    #[test]
    fn writes_are_refused_while_submitting() {
        let mut session = session(vec![Item::unplaced("a")], PlacementConfig::default());
        session.move_items(&ids(&["a"]), Some(CellCoordinate::origin())).unwrap();
        let pending = session.begin_commit().expect("first commit starts");

        assert!(session.begin_commit().is_none());
        assert!(matches!(
            session.on_list_drop(&"a".into()),
            Err(SessionError::CommitInFlight)
        ));
        assert!(matches!(
            session.set_fill_mode(FillMode::Column),
            Err(SessionError::CommitInFlight)
        ));

        session.finish_commit(pending, Ok(())).unwrap();
        assert!(!session.is_submitting());
    }

    #[test]
    fn failed_save_keeps_moved_items() {
        let mut session = session(vec![Item::unplaced("a")], PlacementConfig::default());
        session.move_items(&ids(&["a"]), Some(CellCoordinate::origin())).unwrap();
        let before = session.pending_changes();

        let pending = session.begin_commit().unwrap();
        let result = session.finish_commit(
            pending,
            Err(SaveError::Rejected {
                status: 403,
                message: "forbidden".into(),
            }),
        );

        assert!(matches!(result, Err(SessionError::Save(_))));
        assert!(!session.is_submitting());
        assert_eq!(session.reload_token(), 0);
        assert_eq!(session.pending_changes(), before);
    }

    #[test]
    fn successful_save_rebases_and_bumps_token() {
        let mut session = session(vec![Item::unplaced("a")], PlacementConfig::default());
        session.move_items(&ids(&["a"]), Some(CellCoordinate::new(2, 3))).unwrap();

        let pending = session.begin_commit().unwrap();
        let outcome = session.finish_commit(pending, Ok(())).unwrap();

        assert_eq!(
            outcome,
            CommitOutcome::Saved {
                saved: 1,
                reload_token: 1,
                reloaded: false
            }
        );
        assert!(session.engine().grid().moved().is_empty());
        let item = session.engine().grid().item(&"a".into()).unwrap();
        assert_eq!(item.row_coordinate.as_deref(), Some("B"));
        assert_eq!(item.column_coordinate, Some(3));
    }

    #[tokio::test]
    async fn commit_saves_diff_and_reloads() {
        let repo = InMemoryRepository::new();
        repo.insert_batch(
            batch(),
            vec![Item::unplaced("A1"), Item::placed("A2", "A", 1), Item::unplaced("A3")],
        );
        let mut session = BatchSession::open(&repo, batch(), plate(), PlacementConfig::default())
            .await
            .unwrap();

        session.move_items(&ids(&["A1"]), Some(CellCoordinate::new(1, 1))).unwrap();
        session.on_item_click(&"A3".into(), false).unwrap();
        let outcome = session.commit(&repo, &repo).await.unwrap();

        assert_eq!(
            outcome,
            CommitOutcome::Saved {
                saved: 2,
                reload_token: 1,
                reloaded: true
            }
        );
        assert_eq!(repo.saved_batches(), 1);
        let stored = repo.items(&batch()).unwrap();
        let a1 = stored.iter().find(|item| item.id.as_str() == "A1").unwrap();
        assert_eq!(a1.row_coordinate.as_deref(), Some("A"));
        let a2 = stored.iter().find(|item| item.id.as_str() == "A2").unwrap();
        assert_eq!(a2.row_coordinate, None);

        assert!(session.engine().grid().moved().is_empty());
        assert!(session.engine().selection().is_empty());
        assert_eq!(
            session.engine().grid().occupant(CellCoordinate::origin()),
            Some(&ItemId::from("A1"))
        );
    }

    #[tokio::test]
    async fn commit_without_changes_skips_the_sink() {
        let repo = InMemoryRepository::new();
        repo.insert_batch(batch(), vec![Item::placed("A2", "A", 1)]);
        let mut session = BatchSession::open(&repo, batch(), plate(), PlacementConfig::default())
            .await
            .unwrap();

        let outcome = session.commit(&repo, &repo).await.unwrap();
        assert_eq!(outcome, CommitOutcome::NothingToSave);
        assert_eq!(repo.saved_batches(), 0);
    }

    #[tokio::test]
    async fn rejected_commit_can_be_retried() {
        let repo = InMemoryRepository::new();
        repo.insert_batch(batch(), vec![Item::unplaced("a")]);
        let mut session = BatchSession::open(&repo, batch(), plate(), PlacementConfig::default())
            .await
            .unwrap();
        session.move_items(&ids(&["a"]), Some(CellCoordinate::origin())).unwrap();

        repo.reject_saves(true);
        assert!(matches!(
            session.commit(&repo, &repo).await,
            Err(SessionError::Save(_))
        ));
        assert_eq!(session.pending_changes().len(), 1);

        repo.reject_saves(false);
        let outcome = session.commit(&repo, &repo).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Saved { saved: 1, .. }));
    }

    #[tokio::test]
    async fn shared_commit_ignores_reentrant_calls() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_batch(batch(), vec![Item::unplaced("a")]);
        let session = BatchSession::open(repo.as_ref(), batch(), plate(), PlacementConfig::default())
            .await
            .unwrap();
        let session = Arc::new(Mutex::new(session));
        session
            .lock()
            .await
            .move_items(&ids(&["a"]), Some(CellCoordinate::origin()))
            .unwrap();

        let pending = session.lock().await.begin_commit().unwrap();
        let second = commit_shared(session.clone(), repo.clone()).await.unwrap();
        assert_eq!(second, CommitOutcome::AlreadySubmitting);
        assert_eq!(repo.saved_batches(), 0);

        session.lock().await.finish_commit(pending, Ok(())).unwrap();
        let third = commit_shared(session.clone(), repo.clone()).await.unwrap();
        assert_eq!(third, CommitOutcome::NothingToSave);
    }

    /// Sink whose saves wait until released, backed by an in-memory store.
    struct GatedRepository {
        store: InMemoryRepository,
        gate: Notify,
    }

    #[async_trait]
    impl ItemSource for GatedRepository {
        async fn fetch_items(&self, batch: &BatchId) -> Result<Vec<Item>, SourceError> {
            self.store.fetch_items(batch).await
        }
    }

    #[async_trait]
    impl ItemSink for GatedRepository {
        async fn save(&self, batch: &BatchId, changes: &[ItemUpdate]) -> Result<(), SaveError> {
            self.gate.notified().await;
            self.store.save(batch, changes).await
        }
    }

    fn gated_repository() -> Arc<GatedRepository> {
        let store = InMemoryRepository::new();
        store.insert_batch(batch(), vec![Item::unplaced("a")]);
        Arc::new(GatedRepository {
            store,
            gate: Notify::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_commit_releases_the_session() {
        let repo = gated_repository();
        let mut session =
            BatchSession::open(repo.as_ref(), batch(), plate(), PlacementConfig::default())
                .await
                .unwrap();
        session.move_items(&ids(&["a"]), Some(CellCoordinate::origin())).unwrap();

        let cut_off = tokio::time::timeout(
            Duration::from_millis(50),
            session.commit(repo.as_ref(), repo.as_ref()),
        )
        .await;
        assert!(cut_off.is_err());

        assert!(!session.is_submitting());
        assert_eq!(session.pending_changes().len(), 1);
        session.clear_grid().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shared_commit_finishes_after_caller_goes_away() {
        let repo = gated_repository();
        let session =
            BatchSession::open(repo.as_ref(), batch(), plate(), PlacementConfig::default())
                .await
                .unwrap();
        let session = Arc::new(Mutex::new(session));
        session
            .lock()
            .await
            .move_items(&ids(&["a"]), Some(CellCoordinate::origin()))
            .unwrap();

        let cut_off = tokio::time::timeout(
            Duration::from_millis(50),
            commit_shared(session.clone(), repo.clone()),
        )
        .await;
        assert!(cut_off.is_err());
        assert!(session.lock().await.is_submitting());
        assert!(matches!(
            session.lock().await.clear_grid(),
            Err(SessionError::CommitInFlight)
        ));

        repo.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.lock().await.is_submitting() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let session = session.lock().await;
        assert_eq!(session.reload_token(), 1);
        assert!(session.pending_changes().is_empty());
        assert_eq!(repo.store.saved_batches(), 1);
        let stored = repo.store.items(&batch()).unwrap();
        assert_eq!(stored[0].row_coordinate.as_deref(), Some("A"));
    }

    #[test]
    fn invalid_dimensions_are_rejected_on_load() {
        let zero_rows = GridDimensions {
            number_of_rows: 0,
            number_of_columns: 12,
        };
        let oversized = GridDimensions {
            number_of_rows: 65_536,
            number_of_columns: 65_536,
        };
        for dims in [zero_rows, oversized] {
            let result =
                BatchSession::from_items(batch(), vec![], dims, PlacementConfig::default());
            assert!(matches!(result, Err(ValidationError::InvalidDimension(_))));
        }
    }

    #[tokio::test]
    async fn reload_replaces_state_wholesale() {
        let repo = InMemoryRepository::new();
        repo.insert_batch(batch(), vec![Item::unplaced("a")]);
        let config = PlacementConfig::builder()
            .row_labels(RowLabelScheme::Alphabetic)
            .build();
        let mut session = BatchSession::open(&repo, batch(), plate(), config).await.unwrap();
        session.move_items(&ids(&["a"]), Some(CellCoordinate::origin())).unwrap();
        session.set_fill_mode(FillMode::Column).unwrap();

        repo.insert_batch(batch(), vec![Item::placed("b", "H", 12)]);
        let report = session.reload(&repo).await.unwrap().clone();

        assert_eq!(report.placed, 1);
        let grid = session.engine().grid();
        assert!(!grid.contains(&"a".into()));
        assert!(grid.moved().is_empty());
        assert_eq!(session.engine().fill_mode(), FillMode::Column);
    }
}
