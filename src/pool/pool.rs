// ============================================================================
// Structure : Pool
// ============================================================================
// Tampon par wallet des records récupérés mais pas encore servis à la liste.
//
// Invariants :
// - buffer trié du plus récent au plus ancien, sans doublon d'uid
// - au plus un fetch en cours (fetch_in_flight)
// - exhausted ne repasse jamais à false
// ============================================================================

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use crate::models::{newest_first, Cursor, TransactionRecord, WalletKey};

/// Tampon de pagination d'une source
#[derive(Debug)]
pub struct Pool {
    wallet: WalletKey,

    /// Identifiant de cette instance de pool : change si le wallet est
    /// retiré puis ré-ajouté (les résultats de l'ancien fetch sont ignorés)
    generation: u64,

    /// Records pas encore servis, plus récent en tête
    buffer: VecDeque<TransactionRecord>,

    /// Tous les uid déjà vus par ce pool (servis ou non)
    known: HashSet<String>,

    /// Plus ancien record récupéré auprès de la source
    cursor: Option<Cursor>,

    /// Records poussés avant la première page : classés à son arrivée
    held: Vec<TransactionRecord>,

    exhausted: bool,

    fetch_in_flight: bool,

    /// true si le dernier fetch a échoué (remis à false au prochain succès)
    failed: bool,

    /// Nombre d'échecs consécutifs (sert au backoff)
    failures: u32,

    /// Fetch suspendu en attendant la fin du backoff
    deferred: bool,
}

impl Pool {
    pub fn new(wallet: WalletKey, generation: u64) -> Self {
        Self {
            wallet,
            generation,
            buffer: VecDeque::new(),
            known: HashSet::new(),
            cursor: None,
            held: Vec::new(),
            exhausted: false,
            fetch_in_flight: false,
            failed: false,
            failures: 0,
            deferred: false,
        }
    }

    pub fn wallet(&self) -> &WalletKey {
        &self.wallet
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_in_flight
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Record en tête du buffer (le plus récent pas encore servi)
    pub fn peek(&self) -> Option<&TransactionRecord> {
        self.buffer.front()
    }

    /// Records en attente, plus récent d'abord
    pub fn records(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.buffer.iter()
    }

    /// true quand le buffer est vide, la source non épuisée et aucun fetch en cours
    pub fn needs_fetch(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted && !self.fetch_in_flight
    }

    /// needs_fetch() hors période de backoff
    pub fn can_fetch(&self) -> bool {
        self.needs_fetch() && !self.deferred
    }

    /// Suspend les fetchs jusqu'à resume() (backoff après un échec)
    pub fn defer(&mut self) {
        self.deferred = true;
    }

    pub fn resume(&mut self) {
        self.deferred = false;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Marque le début d'un fetch ; l'appelant lance l'adapter puis appelle append()
    pub fn begin_fetch(&mut self) {
        self.fetch_in_flight = true;
    }

    /// Intègre une page récupérée auprès de la source
    ///
    /// - dédoublonne par uid (chevauchement avec le curseur = warning)
    /// - avance le curseur au plus ancien record de la page
    /// - marque la source épuisée si la page est plus petite que demandé,
    ///   ou si une page pleine n'apporte aucun record nouveau (source qui ignore le curseur)
    pub fn append(&mut self, records: Vec<TransactionRecord>, mark_exhausted_if_fewer_than: usize) {
        self.fetch_in_flight = false;
        self.failed = false;
        self.failures = 0;

        let received = records.len();
        if received < mark_exhausted_if_fewer_than {
            debug!(wallet = %self.wallet, received, limit = mark_exhausted_if_fewer_than, "Source exhausted");
            self.exhausted = true;
        }

        let mut cursor_moved = false;
        if let Some(oldest) = records.iter().min_by_key(|record| record.sort_key()) {
            let cursor = oldest.cursor();
            if self.cursor.as_ref().map_or(true, |current| cursor.key < current.key) {
                self.cursor = Some(cursor);
                cursor_moved = true;
            }
        }

        let duplicates = self.merge(records);
        if duplicates > 0 {
            warn!(
                wallet = %self.wallet,
                duplicates,
                "Source returned records overlapping its cursor, dropped duplicates"
            );
        }

        // Page sans record nouveau : la source ignore le curseur
        if received > 0 && duplicates == received && !cursor_moved && !self.exhausted {
            warn!(wallet = %self.wallet, received, "Source ignored its cursor, marked exhausted");
            self.exhausted = true;
        }

        if !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            self.insert(held);
        }
    }

    /// Le fetch a échoué : on libère le flag sans marquer la source épuisée
    pub fn fetch_failed(&mut self) {
        self.fetch_in_flight = false;
        self.failed = true;
        self.failures = self.failures.saturating_add(1);
    }

    /// Retire et retourne jusqu'à `count` records depuis la tête du buffer
    pub fn take(&mut self, count: usize) -> Vec<TransactionRecord> {
        let count = count.min(self.buffer.len());
        self.buffer.drain(..count).collect()
    }

    /// Retire le record de tête
    pub fn pop(&mut self) -> Option<TransactionRecord> {
        self.buffer.pop_front()
    }

    /// Ajoute des records poussés par la source (hors pagination)
    ///
    /// Un record déjà présent dans le buffer est remplacé par sa nouvelle version.
    /// Un record plus ancien que le curseur d'une source non épuisée est ignoré :
    /// il arrivera avec sa page. Avant la première page, les records sont
    /// mis de côté jusqu'à ce que le curseur permette de les classer.
    pub fn insert(&mut self, records: Vec<TransactionRecord>) {
        for record in records {
            if let Some(existing) = self.buffer.iter_mut().find(|r| r.uid == record.uid) {
                *existing = record;
            } else if !self.exhausted && self.cursor.is_none() {
                debug!(wallet = %self.wallet, uid = %record.uid, "Pushed record held until first page");
                self.held.retain(|r| r.uid != record.uid);
                self.held.push(record);
            } else if !self.exhausted && self.cursor.as_ref().map_or(false, |cursor| cursor.is_before(&record)) {
                debug!(wallet = %self.wallet, uid = %record.uid, "Pushed record behind cursor, left to pagination");
            } else {
                self.known.insert(record.uid.clone());
                self.buffer.push_back(record);
            }
        }
        self.buffer.make_contiguous().sort_by(newest_first);
    }

    /// Remet dans le buffer des records déjà servis (changement de filtre)
    ///
    /// Ne touche ni au curseur, ni à exhausted, ni au fetch en cours.
    /// La version affichée d'un record remplace celle restée dans le buffer.
    pub fn put_back(&mut self, records: Vec<TransactionRecord>) {
        for record in records {
            if let Some(existing) = self.buffer.iter_mut().find(|r| r.uid == record.uid) {
                *existing = record;
            } else {
                self.known.insert(record.uid.clone());
                self.buffer.push_back(record);
            }
        }
        self.buffer.make_contiguous().sort_by(newest_first);
    }

    /// Fusionne dans le buffer en ignorant les uid déjà vus ; retourne le nombre de doublons
    fn merge(&mut self, records: Vec<TransactionRecord>) -> usize {
        let mut duplicates = 0;
        for record in records {
            if self.known.insert(record.uid.clone()) {
                self.buffer.push_back(record);
            } else {
                duplicates += 1;
            }
        }
        self.buffer.make_contiguous().sort_by(newest_first);
        duplicates
    }
}
