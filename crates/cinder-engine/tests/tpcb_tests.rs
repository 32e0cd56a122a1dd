//! A minimal TPC-B over array storages.
//!
//! Tiny scaling so the test runs fast: 8 branches × 2 tellers × 4
//! accounts, 100 transactions per client, amounts in [1, 20]. Histories
//! land in a per-transaction slot of their own array. After the run, a
//! single verification transaction replays the history and checks every
//! branch, teller, and account balance.

mod common;

use cinder_engine::{ArrayStorage, Engine, IsolationLevel, ThreadContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const BRANCHES: u64 = 8;
const TELLERS: u64 = 2;
const ACCOUNTS: u64 = 4;
const ACCOUNTS_PER_TELLER: u64 = ACCOUNTS / TELLERS;
const MAX_CLIENTS: u64 = 4;
const XCTS_PER_CLIENT: u64 = 100;
const INITIAL_ACCOUNT_BALANCE: i64 = 100;
const HISTORIES: u64 = MAX_CLIENTS * XCTS_PER_CLIENT;

// Branch payload: [balance i64][pad]. Teller/account: [branch u64]
// [balance i64]. History: [account u64][teller u64][branch u64][amount
// i64].
const BALANCE_OFFSET: u16 = 8;

struct Tpcb {
    branches: Arc<ArrayStorage>,
    tellers: Arc<ArrayStorage>,
    accounts: Arc<ArrayStorage>,
    histories: Arc<ArrayStorage>,
}

fn create_and_populate(engine: &Arc<Engine>, ctx: &mut ThreadContext) -> Tpcb {
    let registry = engine.registry();
    let branches = registry.create_array("branches", 16, BRANCHES).unwrap();
    let tellers = registry
        .create_array("tellers", 16, BRANCHES * TELLERS)
        .unwrap();
    let accounts = registry
        .create_array("accounts", 16, BRANCHES * ACCOUNTS)
        .unwrap();
    let histories = registry.create_array("histories", 32, HISTORIES).unwrap();

    let mut highest = cinder_engine::Epoch::INVALID;
    highest.store_max(
        ctx.retry_transaction(|xct| {
            for i in 0..BRANCHES {
                branches.overwrite_primitive::<i64>(
                    xct,
                    i,
                    INITIAL_ACCOUNT_BALANCE * ACCOUNTS as i64,
                    0,
                )?;
            }
            Ok(())
        })
        .unwrap(),
    );
    highest.store_max(
        ctx.retry_transaction(|xct| {
            for i in 0..BRANCHES * TELLERS {
                tellers.overwrite_primitive::<u64>(xct, i, i / TELLERS, 0)?;
                tellers.overwrite_primitive::<i64>(
                    xct,
                    i,
                    INITIAL_ACCOUNT_BALANCE * ACCOUNTS_PER_TELLER as i64,
                    BALANCE_OFFSET,
                )?;
            }
            Ok(())
        })
        .unwrap(),
    );
    highest.store_max(
        ctx.retry_transaction(|xct| {
            for i in 0..BRANCHES * ACCOUNTS {
                accounts.overwrite_primitive::<u64>(xct, i, i / ACCOUNTS, 0)?;
                accounts.overwrite_primitive::<i64>(
                    xct,
                    i,
                    INITIAL_ACCOUNT_BALANCE,
                    BALANCE_OFFSET,
                )?;
            }
            Ok(())
        })
        .unwrap(),
    );
    engine.wait_for_commit(highest).unwrap();
    Tpcb {
        branches,
        tellers,
        accounts,
        histories,
    }
}

fn run_client(
    tpcb: &Tpcb,
    ctx: &mut ThreadContext,
    client: u64,
    contended: bool,
) -> cinder_engine::Epoch {
    let mut rng = StdRng::seed_from_u64(client);
    let mut highest = cinder_engine::Epoch::INVALID;
    for i in 0..XCTS_PER_CLIENT {
        let account_id = if contended {
            rng.gen_range(0..BRANCHES * ACCOUNTS)
        } else {
            let per_client = BRANCHES * ACCOUNTS / MAX_CLIENTS;
            client * per_client + rng.gen_range(0..per_client)
        };
        let teller_id = account_id / ACCOUNTS_PER_TELLER;
        let branch_id = account_id / ACCOUNTS;
        let history_id = client * XCTS_PER_CLIENT + i;
        let amount: i64 = rng.gen_range(1..=20);

        let commit_epoch = ctx
            .retry_transaction(|xct| {
                tpcb.branches.increment::<i64>(xct, branch_id, amount, 0)?;
                tpcb.tellers
                    .increment::<i64>(xct, teller_id, amount, BALANCE_OFFSET)?;
                tpcb.accounts
                    .increment::<i64>(xct, account_id, amount, BALANCE_OFFSET)?;

                let mut history = [0u8; 32];
                history[0..8].copy_from_slice(&account_id.to_le_bytes());
                history[8..16].copy_from_slice(&teller_id.to_le_bytes());
                history[16..24].copy_from_slice(&branch_id.to_le_bytes());
                history[24..32].copy_from_slice(&amount.to_le_bytes());
                tpcb.histories.overwrite(xct, history_id, &history)?;
                Ok(())
            })
            .unwrap();
        highest.store_max(commit_epoch);
    }
    highest
}

fn verify(tpcb: &Tpcb, ctx: &mut ThreadContext, clients: u64) {
    ctx.begin(IsolationLevel::Serializable).unwrap();
    let xct = ctx.xct();

    let mut expected_branch = vec![INITIAL_ACCOUNT_BALANCE * ACCOUNTS as i64; BRANCHES as usize];
    let mut expected_teller =
        vec![INITIAL_ACCOUNT_BALANCE * ACCOUNTS_PER_TELLER as i64; (BRANCHES * TELLERS) as usize];
    let mut expected_account = vec![INITIAL_ACCOUNT_BALANCE; (BRANCHES * ACCOUNTS) as usize];

    for client in 0..clients {
        for i in 0..XCTS_PER_CLIENT {
            let history_id = client * XCTS_PER_CLIENT + i;
            let mut history = [0u8; 32];
            tpcb.histories.get(xct, history_id, &mut history).unwrap();
            let account = u64::from_le_bytes(history[0..8].try_into().unwrap());
            let teller = u64::from_le_bytes(history[8..16].try_into().unwrap());
            let branch = u64::from_le_bytes(history[16..24].try_into().unwrap());
            let amount = i64::from_le_bytes(history[24..32].try_into().unwrap());

            assert!((1..=20).contains(&amount), "history {}", history_id);
            assert!(branch < BRANCHES);
            assert_eq!(branch, teller / TELLERS);
            assert_eq!(branch, account / ACCOUNTS);
            assert_eq!(teller, account / ACCOUNTS_PER_TELLER);

            expected_branch[branch as usize] += amount;
            expected_teller[teller as usize] += amount;
            expected_account[account as usize] += amount;
        }
    }

    for (i, expected) in expected_branch.iter().enumerate() {
        let balance = tpcb
            .branches
            .get_primitive::<i64>(xct, i as u64, 0)
            .unwrap();
        assert_eq!(balance, *expected, "branch {}", i);
    }
    for (i, expected) in expected_teller.iter().enumerate() {
        let owner = tpcb.tellers.get_primitive::<u64>(xct, i as u64, 0).unwrap();
        assert_eq!(owner, i as u64 / TELLERS, "teller {} branch", i);
        let balance = tpcb
            .tellers
            .get_primitive::<i64>(xct, i as u64, BALANCE_OFFSET)
            .unwrap();
        assert_eq!(balance, *expected, "teller {}", i);
    }
    for (i, expected) in expected_account.iter().enumerate() {
        let owner = tpcb
            .accounts
            .get_primitive::<u64>(xct, i as u64, 0)
            .unwrap();
        assert_eq!(owner, i as u64 / ACCOUNTS, "account {} branch", i);
        let balance = tpcb
            .accounts
            .get_primitive::<i64>(xct, i as u64, BALANCE_OFFSET)
            .unwrap();
        assert_eq!(balance, *expected, "account {}", i);
    }

    ctx.abort().unwrap();
}

fn tpcb_test(clients: u64, contended: bool) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let mut main_ctx = engine.attach_thread();
    let tpcb = create_and_populate(&engine, &mut main_ctx);

    let mut highest = cinder_engine::Epoch::INVALID;
    if clients == 1 {
        highest.store_max(run_client(&tpcb, &mut main_ctx, 0, contended));
    } else {
        let mut contexts: Vec<ThreadContext> =
            (0..clients).map(|_| engine.attach_thread()).collect();
        let epochs = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for (client, mut ctx) in contexts.drain(..).enumerate() {
                let tpcb = &tpcb;
                handles.push(scope.spawn(move || {
                    run_client(tpcb, &mut ctx, client as u64, contended)
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        for epoch in epochs {
            highest.store_max(epoch);
        }
    }
    engine.wait_for_commit(highest).unwrap();

    verify(&tpcb, &mut main_ctx, clients);
    engine.shutdown();
}

#[test]
fn tpcb_single_thread_no_contention() {
    tpcb_test(1, false);
}

#[test]
fn tpcb_two_threads_no_contention() {
    tpcb_test(2, false);
}

#[test]
fn tpcb_four_threads_contended() {
    tpcb_test(4, true);
}
