use anchor_lang::prelude::*;
use anchor_lang::solana_program::hash::hash;
use anchor_lang::solana_program::program::invoke;
use anchor_lang::solana_program::system_instruction;
use anchor_lang::solana_program::sysvar::slot_hashes;

declare_id!("Byn4gnsR2JgmeyrSXYg4e4iCms2ou56pMV35bEhSWFZk");

#[cfg(not(feature = "no-entrypoint"))]
use solana_security_txt::security_txt;

#[cfg(not(feature = "no-entrypoint"))]
security_txt! {
    name: "Casino Plinko",
    project_url: "https://explorer.solana.com/address/Byn4gnsR2JgmeyrSXYg4e4iCms2ou56pMV35bEhSWFZk?cluster=devnet",
    contacts: "link:https://explorer.solana.com/address/Byn4gnsR2JgmeyrSXYg4e4iCms2ou56pMV35bEhSWFZk?cluster=devnet",
    policy: "Report issues privately to the upgrade authority before disclosure",
    preferred_languages: "en",
    auditors: "Unaudited. Outcome via on-chain commit-reveal over SlotHashes"
}


// ── Constants ─────────────────────────────────────────────────────────────
pub const SCHEMA_VERSION:     u8  = 1;
pub const BPS_ONE:            u64 = 10_000;  // 1.00x
pub const REVEAL_WINDOW:      u64 = 400;     // slots after resolve_slot before a bet can be expired
pub const SLOT_HASH_LOOKBACK: u64 = 512;     // entries kept by the SlotHashes sysvar
pub const MIX_SLOTS:          usize = 3;     // consecutive slot hashes folded into each seed
pub const BASE_RESOLVE_DELAY: u64 = 5;

// ── PDA Seeds ────────────────────────────────────────────────────────────
pub const PLAYER_SEED:   &[u8] = b"player_account";
pub const GAME_SEED:     &[u8] = b"game_account";
pub const TREASURY_SEED: &[u8] = b"treasury";

// ── Payout Table ─────────────────────────────────────────────────────────
// Nine buckets under an eight-row board. Weights follow the binomial row
// C(8, k) so they sum to 256 and a u64 roll maps onto them without bias.
// A bucket at or below 1.00x is a loss: the whole stake stays with the house.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayoutSlot {
    pub multiplier_bps: u64,
    pub weight:         u64,
}

pub const PAYOUT_TABLE: [PayoutSlot; 9] = [
    PayoutSlot { multiplier_bps: 100_000, weight: 1 },  // 10x
    PayoutSlot { multiplier_bps:  40_000, weight: 8 },  // 4x
    PayoutSlot { multiplier_bps:  20_000, weight: 28 }, // 2x
    PayoutSlot { multiplier_bps:   5_000, weight: 56 }, // 0.5x (loss)
    PayoutSlot { multiplier_bps:   3_000, weight: 70 }, // 0.3x (loss)
    PayoutSlot { multiplier_bps:   5_000, weight: 56 }, // 0.5x (loss)
    PayoutSlot { multiplier_bps:  20_000, weight: 28 }, // 2x
    PayoutSlot { multiplier_bps:  40_000, weight: 8 },  // 4x
    PayoutSlot { multiplier_bps: 100_000, weight: 1 },  // 10x
];

pub const TOTAL_WEIGHT: u64 = 256;
pub const MAX_MULTIPLIER_BPS: u64 = max_multiplier(&PAYOUT_TABLE);

const fn table_weight(table: &[PayoutSlot]) -> u64 {
    let mut sum = 0;
    let mut i = 0;
    while i < table.len() {
        sum += table[i].weight;
        i += 1;
    }
    sum
}

const fn max_multiplier(table: &[PayoutSlot]) -> u64 {
    let mut max = 0;
    let mut i = 0;
    while i < table.len() {
        if table[i].multiplier_bps > max {
            max = table[i].multiplier_bps;
        }
        i += 1;
    }
    max
}

const _: () = assert!(table_weight(&PAYOUT_TABLE) == TOTAL_WEIGHT);
// Every slot inside the reveal window still has its hashes in SlotHashes.
const _: () = assert!(REVEAL_WINDOW + (MIX_SLOTS as u64) < SLOT_HASH_LOOKBACK);

#[program]
pub mod casino_plinko {
    use super::*;

    // ── House ─────────────────────────────────────────────────────
    pub fn initialize_house(
        ctx: Context<InitializeHouse>,
        min_bet:          u64,
        max_payout_bps:   u16,
        starting_balance: u64,
        initial_funding:  u64,
    ) -> Result<()> {
        validate_house_config(min_bet, max_payout_bps)?;
        let authority = ctx.accounts.authority.key();
        let treasury  = &mut ctx.accounts.treasury;
        treasury.ensure_uninitialized()?;

        treasury.set_inner(Treasury::new(
            authority, min_bet, max_payout_bps, starting_balance, ctx.bumps.treasury,
        ));

        if initial_funding > 0 {
            let treasury_ai = treasury.to_account_info();
            pull_from_wallet(&ctx.accounts.authority, &treasury_ai, initial_funding)?;
            treasury.credit(initial_funding)?;
            verify_backing(&treasury_ai, treasury.balance)?;
        }

        emit!(HouseInitialized {
            authority, min_bet, max_payout_bps, starting_balance, balance: treasury.balance,
        });
        Ok(())
    }

    // ── Player: create ledger account (AlreadyExists on repeat) ──
    pub fn initialize_player(ctx: Context<InitializePlayer>) -> Result<()> {
        let owner    = ctx.accounts.owner.key();
        let player   = &mut ctx.accounts.player_account;
        let treasury = &mut ctx.accounts.treasury;
        player.ensure_uninitialized()?;

        player.set_inner(PlayerAccount::new(owner, ctx.bumps.player_account));

        // Seeded balance comes out of the house, never out of thin air.
        let seeded = treasury.starting_balance;
        if seeded > 0 {
            require!(treasury.balance >= seeded, PlinkoError::HouseInsolvent);
            transfer(&mut **treasury, &mut **player, seeded)?;
            let treasury_ai = treasury.to_account_info();
            let player_ai   = player.to_account_info();
            shift_lamports(&treasury_ai, &player_ai, seeded)?;
            verify_backing(&treasury_ai, treasury.balance)?;
            verify_backing(&player_ai, player.balance)?;
        }

        emit!(PlayerInitialized { owner, balance: player.balance });
        Ok(())
    }

    pub fn deposit_funds(ctx: Context<DepositFunds>, amount: u64) -> Result<()> {
        require!(amount > 0, PlinkoError::InvalidAmount);
        let player_ai = ctx.accounts.player_account.to_account_info();
        pull_from_wallet(&ctx.accounts.owner, &player_ai, amount)?;

        let player = &mut ctx.accounts.player_account;
        player.record_deposit(amount)?;
        verify_backing(&player_ai, player.balance)?;

        emit!(FundsDeposited { owner: player.owner, amount, balance: player.balance });
        Ok(())
    }

    // ── Game: one session account per player ─────────────────────
    pub fn initialize_game(ctx: Context<InitializeGame>, initial_funding: u64) -> Result<()> {
        let owner = ctx.accounts.owner.key();
        let game  = &mut ctx.accounts.game_account;
        game.ensure_uninitialized()?;
        game.set_inner(GameAccount::new(owner, ctx.bumps.game_account));

        let treasury = &mut ctx.accounts.treasury;
        if initial_funding > 0 {
            let treasury_ai = treasury.to_account_info();
            pull_from_wallet(&ctx.accounts.owner, &treasury_ai, initial_funding)?;
            treasury.credit(initial_funding)?;
            verify_backing(&treasury_ai, treasury.balance)?;
        }

        emit!(GameInitialized { owner, initial_funding, treasury_balance: treasury.balance });
        Ok(())
    }

    // ── Fund the treasury (anyone can add liquidity) ──────────────
    pub fn top_up_game_account(ctx: Context<TopUpGameAccount>, amount: u64) -> Result<()> {
        require!(amount > 0, PlinkoError::InvalidAmount);
        let treasury_ai = ctx.accounts.treasury.to_account_info();
        pull_from_wallet(&ctx.accounts.payer, &treasury_ai, amount)?;

        let treasury = &mut ctx.accounts.treasury;
        treasury.credit(amount)?;
        verify_backing(&treasury_ai, treasury.balance)?;

        emit!(TreasuryToppedUp { payer: ctx.accounts.payer.key(), amount, balance: treasury.balance });
        Ok(())
    }

    // ── Place Bet: lock stake into escrow, commit to a nonce ─────
    pub fn place_bet(ctx: Context<PlaceBet>, amount: u64, commitment: [u8; 32]) -> Result<()> {
        let clock    = Clock::get()?;
        let treasury = &ctx.accounts.treasury;
        let player   = &mut ctx.accounts.player_account;
        let game     = &mut ctx.accounts.game_account;

        game.place_bet(player, treasury, amount, commitment, clock.slot)?;

        let player_ai = player.to_account_info();
        let game_ai   = game.to_account_info();
        shift_lamports(&player_ai, &game_ai, amount)?;
        verify_backing(&player_ai, player.balance)?;
        verify_backing(&game_ai, game.bet_amount)?;

        emit!(BetPlaced {
            owner: game.owner, amount,
            resolve_slot: game.resolve_slot, forfeit_slot: game.forfeit_slot,
        });
        Ok(())
    }

    // ── Determine Result: reveal, resolve, settle in one instruction ──
    pub fn determine_result(ctx: Context<DetermineResult>, nonce: [u8; 32]) -> Result<()> {
        let clock = Clock::get()?;
        let seed = {
            let game = &ctx.accounts.game_account;
            game.check_reveal(&nonce, clock.slot)?;
            let data = ctx.accounts.slot_hashes.try_borrow_data()?;
            extract_seed(&data, game.resolve_slot, &nonce, game.bet_amount)?
        };
        let outcome = resolve_outcome(&seed);

        let game     = &mut ctx.accounts.game_account;
        let player   = &mut ctx.accounts.player_account;
        let treasury = &mut ctx.accounts.treasury;

        game.lock_outcome(outcome)?;
        let receipt = settle(game, player, treasury)?;

        let game_ai     = game.to_account_info();
        let player_ai   = player.to_account_info();
        let treasury_ai = treasury.to_account_info();
        shift_lamports(&game_ai, &treasury_ai, receipt.stake)?;
        shift_lamports(&treasury_ai, &player_ai, receipt.payout)?;
        verify_backing(&game_ai, game.bet_amount)?;
        verify_backing(&player_ai, player.balance)?;
        verify_backing(&treasury_ai, treasury.balance)?;

        msg!("slot {} -> {} bps, payout {}", receipt.slot_index, receipt.multiplier_bps, receipt.payout);
        emit!(GameSettled { receipt });
        Ok(())
    }

    // ── Expire (permissionless once the reveal window closes) ─────
    // An unrevealed bet is forfeited to the house, like a loss.
    pub fn expire_bet(ctx: Context<ExpireBet>) -> Result<()> {
        let clock    = Clock::get()?;
        let game     = &mut ctx.accounts.game_account;
        let player   = &mut ctx.accounts.player_account;
        let treasury = &mut ctx.accounts.treasury;

        let forfeited = game.expire(player, treasury, clock.slot)?;

        let game_ai     = game.to_account_info();
        let treasury_ai = treasury.to_account_info();
        shift_lamports(&game_ai, &treasury_ai, forfeited)?;
        verify_backing(&game_ai, game.bet_amount)?;
        verify_backing(&treasury_ai, treasury.balance)?;

        emit!(BetExpired { owner: game.owner, forfeited, caller: ctx.accounts.caller.key() });
        Ok(())
    }

    // ── Reset (authority: full escrow refund; owner: only once nothing is escrowed) ──
    pub fn reset_game(ctx: Context<ResetGame>) -> Result<()> {
        let caller = ctx.accounts.caller.key();
        let game   = &mut ctx.accounts.game_account;
        let player = &mut ctx.accounts.player_account;
        let previous_status = game.status;

        game.authorize_reset(&caller, &ctx.accounts.treasury.authority)?;
        let refund = game.reset(player)?;

        let game_ai   = game.to_account_info();
        let player_ai = player.to_account_info();
        shift_lamports(&game_ai, &player_ai, refund)?;
        verify_backing(&game_ai, game.bet_amount)?;
        verify_backing(&player_ai, player.balance)?;

        emit!(GameReset { owner: game.owner, caller, previous_status, refund });
        Ok(())
    }

    // ── Close player account (remaining balance + rent back to owner) ──
    pub fn close_player_account(ctx: Context<ClosePlayerAccount>) -> Result<()> {
        let player = &mut ctx.accounts.player_account;
        let paid_out = player.drain_for_close()?;
        // `close = owner` moves every lamport, ledger balance included.
        emit!(PlayerAccountClosed { owner: player.owner, paid_out });
        Ok(())
    }

    // ── Admin: limits & pause ─────────────────────────────────────
    pub fn update_house_config(
        ctx: Context<AdminOnly>,
        min_bet:          u64,
        max_payout_bps:   u16,
        starting_balance: u64,
    ) -> Result<()> {
        validate_house_config(min_bet, max_payout_bps)?;
        let treasury = &mut ctx.accounts.treasury;
        treasury.min_bet          = min_bet;
        treasury.max_payout_bps   = max_payout_bps;
        treasury.starting_balance = starting_balance;

        emit!(HouseConfigUpdated { min_bet, max_payout_bps, starting_balance });
        Ok(())
    }

    pub fn set_paused(ctx: Context<AdminOnly>, paused: bool) -> Result<()> {
        ctx.accounts.treasury.paused = paused;
        emit!(PauseToggled { paused });
        Ok(())
    }

    // ── Admin: Migrate an account written under an older schema ───
    pub fn migrate_account(ctx: Context<MigrateAccount>, kind: AccountKind, owner: Pubkey) -> Result<()> {
        let authority_key = ctx.accounts.authority.key();
        {
            // Raw read: an outdated treasury may not deserialize yet.
            let data = ctx.accounts.treasury.try_borrow_data()?;
            let stored = data.get(9..41).ok_or(PlinkoError::NotFound)?;
            require!(stored == authority_key.as_ref(), PlinkoError::Unauthorized);
        }

        let target = &ctx.accounts.target;
        let (expected, _bump) = derive_address(kind, &owner, ctx.program_id)?;
        require_keys_eq!(target.key(), expected, PlinkoError::NotFound);
        require!(target.owner == ctx.program_id, PlinkoError::NotFound);
        require!(target.data_len() > 8, PlinkoError::NotFound);

        let old_size = target.data_len();
        let new_size = 8 + kind.current_len();
        let from_version = target.try_borrow_data()?[8];

        if from_version >= SCHEMA_VERSION && old_size >= new_size {
            msg!("Account already current: v{} / {} bytes", from_version, old_size);
            return Ok(());
        }

        if old_size < new_size {
            let rent = Rent::get()?;
            let diff = rent.minimum_balance(new_size).saturating_sub(rent.minimum_balance(old_size));
            if diff > 0 {
                pull_from_wallet(&ctx.accounts.authority, &target.to_account_info(), diff)?;
            }
            target.realloc(new_size, false)?;

            // Zero-fill only the appended bytes.
            let mut data = target.try_borrow_mut_data()?;
            for byte in data[old_size..new_size].iter_mut() {
                *byte = 0;
            }
        }
        target.try_borrow_mut_data()?[8] = SCHEMA_VERSION;

        msg!("Migrated {:?}: {} -> {} bytes", kind, old_size, new_size.max(old_size));
        emit!(AccountMigrated {
            account: expected, kind, from_version, to_version: SCHEMA_VERSION,
            old_size: old_size as u32, new_size: new_size.max(old_size) as u32,
        });
        Ok(())
    }

    // ── Views (read-only projections, never authoritative caches) ──
    pub fn get_house_stats(ctx: Context<GetHouseStats>) -> Result<HouseStats> {
        let t = &ctx.accounts.treasury;
        Ok(HouseStats {
            balance:        t.balance,
            min_bet:        t.min_bet,
            payout_cap:     t.payout_cap(),
            paused:         t.paused,
            total_bets:     t.total_bets,
            total_wagered:  t.total_wagered,
            total_paid_out: t.total_paid_out,
            biggest_win:    t.biggest_win,
        })
    }

    pub fn get_player_summary(ctx: Context<GetPlayerSummary>) -> Result<PlayerSummary> {
        let p = &ctx.accounts.player_account;
        let g = &ctx.accounts.game_account;
        Ok(PlayerSummary {
            owner:         p.owner,
            balance:       p.balance,
            in_play:       p.in_play,
            status:        g.status,
            last_result:   g.result,
            rounds_played: g.rounds_played,
        })
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  HELPERS
// ══════════════════════════════════════════════════════════════════════════

fn validate_house_config(min_bet: u64, max_payout_bps: u16) -> Result<()> {
    require!(min_bet > 0, PlinkoError::InvalidConfig);
    require!(
        max_payout_bps > 0 && max_payout_bps as u64 <= BPS_ONE,
        PlinkoError::InvalidConfig
    );
    Ok(())
}

/// System transfer from a signing wallet into a program account.
fn pull_from_wallet<'info>(from: &Signer<'info>, to: &AccountInfo<'info>, amount: u64) -> Result<()> {
    let ix = system_instruction::transfer(&from.key(), to.key, amount);
    invoke(&ix, &[from.to_account_info(), to.clone()])?;
    Ok(())
}

/// Direct lamport move between two accounts this program owns.
fn shift_lamports(from: &AccountInfo, to: &AccountInfo, amount: u64) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let from_next = from.lamports().checked_sub(amount).ok_or(PlinkoError::AccountingBroken)?;
    let to_next   = to.lamports().checked_add(amount).ok_or(PlinkoError::Overflow)?;
    **from.try_borrow_mut_lamports()? = from_next;
    **to.try_borrow_mut_lamports()?   = to_next;
    Ok(())
}

/// Physical lamports above rent must cover the ledger figure stored in the account.
fn verify_backing(ai: &AccountInfo, ledger: u64) -> Result<()> {
    let rent = Rent::get()?.minimum_balance(ai.data_len());
    let physical = ai.lamports().saturating_sub(rent);
    require!(physical >= ledger, PlinkoError::AccountingBroken);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════
//  ACCOUNT DERIVER
// ══════════════════════════════════════════════════════════════════════════

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountKind {
    Player,
    Game,
    Treasury,
}

impl AccountKind {
    pub fn label(&self) -> &'static [u8] {
        match self {
            AccountKind::Player   => PLAYER_SEED,
            AccountKind::Game     => GAME_SEED,
            AccountKind::Treasury => TREASURY_SEED,
        }
    }

    pub fn current_len(&self) -> usize {
        match self {
            AccountKind::Player   => PlayerAccount::LEN,
            AccountKind::Game     => GameAccount::LEN,
            AccountKind::Treasury => Treasury::LEN,
        }
    }
}

/// Derived address and bump for `(kind, owner)`. The treasury is a singleton,
/// so `owner` is not mixed into its seeds.
pub fn derive_address(kind: AccountKind, owner: &Pubkey, program_id: &Pubkey) -> Result<(Pubkey, u8)> {
    let found = match kind {
        AccountKind::Treasury => Pubkey::try_find_program_address(&[TREASURY_SEED], program_id),
        _ => Pubkey::try_find_program_address(&[kind.label(), owner.as_ref()], program_id),
    };
    found.ok_or_else(|| PlinkoError::DerivationExhausted.into())
}

pub fn derive_treasury(program_id: &Pubkey) -> Result<(Pubkey, u8)> {
    derive_address(AccountKind::Treasury, &Pubkey::default(), program_id)
}

// ══════════════════════════════════════════════════════════════════════════
//  BALANCE LEDGER
// ══════════════════════════════════════════════════════════════════════════

/// Integer balance held by a program account. Escrow in a game account is a
/// ledger too, so every move of funds goes through `transfer`.
pub trait Ledger {
    fn funds(&self) -> u64;
    fn funds_mut(&mut self) -> &mut u64;

    fn credit(&mut self, amount: u64) -> Result<u64> {
        let next = self.funds().checked_add(amount).ok_or(PlinkoError::Overflow)?;
        *self.funds_mut() = next;
        Ok(next)
    }

    fn debit(&mut self, amount: u64) -> Result<u64> {
        let next = self.funds().checked_sub(amount).ok_or(PlinkoError::InsufficientFunds)?;
        *self.funds_mut() = next;
        Ok(next)
    }
}

/// Both sides are computed before either is written, so a failing credit
/// leaves the debit unobserved.
pub fn transfer<F, T>(from: &mut F, to: &mut T, amount: u64) -> Result<()>
where
    F: Ledger + ?Sized,
    T: Ledger + ?Sized,
{
    let debited  = from.funds().checked_sub(amount).ok_or(PlinkoError::InsufficientFunds)?;
    let credited = to.funds().checked_add(amount).ok_or(PlinkoError::Overflow)?;
    *from.funds_mut() = debited;
    *to.funds_mut()   = credited;
    Ok(())
}

impl Ledger for PlayerAccount {
    fn funds(&self) -> u64 { self.balance }
    fn funds_mut(&mut self) -> &mut u64 { &mut self.balance }
}

impl Ledger for Treasury {
    fn funds(&self) -> u64 { self.balance }
    fn funds_mut(&mut self) -> &mut u64 { &mut self.balance }
}

impl Ledger for GameAccount {
    fn funds(&self) -> u64 { self.bet_amount }
    fn funds_mut(&mut self) -> &mut u64 { &mut self.bet_amount }
}

// ══════════════════════════════════════════════════════════════════════════
//  OUTCOME RESOLVER
// ══════════════════════════════════════════════════════════════════════════

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub slot_index:     u8,
    pub multiplier_bps: u64,
}

/// Walk the cumulative weights. `roll % TOTAL_WEIGHT` is exact because 256
/// divides 2^64.
pub fn select_slot(roll: u64) -> usize {
    let mut point = roll % TOTAL_WEIGHT;
    for (index, slot) in PAYOUT_TABLE.iter().enumerate() {
        if point < slot.weight {
            return index;
        }
        point -= slot.weight;
    }
    PAYOUT_TABLE.len() - 1
}

pub fn multiplier_for_slot(index: usize) -> Result<u64> {
    PAYOUT_TABLE
        .get(index)
        .map(|slot| slot.multiplier_bps)
        .ok_or_else(|| PlinkoError::NotFound.into())
}

pub fn resolve_outcome(seed: &[u8; 32]) -> Outcome {
    let mut roll_bytes = [0u8; 8];
    roll_bytes.copy_from_slice(&seed[0..8]);
    let index = select_slot(u64::from_le_bytes(roll_bytes));
    Outcome {
        slot_index:     index as u8,
        multiplier_bps: PAYOUT_TABLE[index].multiplier_bps,
    }
}

/// Zero at or below 1.00x; `stake * multiplier` otherwise.
pub fn payout_for(stake: u64, multiplier_bps: u64) -> Result<u64> {
    if multiplier_bps <= BPS_ONE {
        return Ok(0);
    }
    let gross = stake as u128 * multiplier_bps as u128 / BPS_ONE as u128;
    u64::try_from(gross).map_err(|_| PlinkoError::Overflow.into())
}

pub fn resolve_slot_for(slot: u64, bet_amount: u64) -> u64 {
    slot.saturating_add(BASE_RESOLVE_DELAY).saturating_add(match bet_amount {
        0..=50_000_000            => 5,
        50_000_001..=500_000_000  => 15 + bet_amount / 50_000_000,
        _                         => 50,
    })
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Blake3 multi-slot seed extraction over raw SlotHashes sysvar data
/// (`u64 count` then `count` × `(u64 slot, [u8; 32] hash)`, newest first).
/// Takes the oldest MIX_SLOTS entries at or after `target_slot`, so the seed
/// does not change as newer slots are appended and tolerates skipped slots.
pub fn extract_seed(
    slot_hashes: &[u8],
    target_slot: u64,
    nonce:       &[u8; 32],
    bet_amount:  u64,
) -> Result<[u8; 32]> {
    let count = read_u64(slot_hashes, 0).ok_or(PlinkoError::SlotHashNotFound)? as usize;
    let count = count.min(SLOT_HASH_LOOKBACK as usize);
    require!(count > 0, PlinkoError::SlotHashNotFound);

    let oldest = read_u64(slot_hashes, 8 + (count - 1) * 40).ok_or(PlinkoError::SlotHashNotFound)?;
    require!(oldest <= target_slot, PlinkoError::SlotTooOld);

    let mut mixed = [[0u8; 32]; MIX_SLOTS];
    let mut found = 0;
    for i in (0..count).rev() {
        let off  = 8 + i * 40;
        let slot = read_u64(slot_hashes, off).ok_or(PlinkoError::SlotHashNotFound)?;
        if slot < target_slot {
            continue;
        }
        let entry = slot_hashes.get(off + 8..off + 40).ok_or(PlinkoError::SlotHashNotFound)?;
        mixed[found].copy_from_slice(entry);
        found += 1;
        if found == MIX_SLOTS {
            break;
        }
    }
    require!(found == MIX_SLOTS, PlinkoError::SlotHashNotFound);

    // Blake3( nonce || hash0 || hash1 || hash2 || slot_bytes || bet_bytes )
    let mut hasher = blake3::Hasher::new();
    hasher.update(nonce);
    for entry in &mixed {
        hasher.update(entry);
    }
    hasher.update(&target_slot.to_le_bytes());
    hasher.update(&bet_amount.to_le_bytes());
    Ok(*hasher.finalize().as_bytes())
}

// ══════════════════════════════════════════════════════════════════════════
//  SESSION STATE MACHINE
// ══════════════════════════════════════════════════════════════════════════

impl GameAccount {
    pub fn new(owner: Pubkey, bump: u8) -> Self {
        Self {
            version:         SCHEMA_VERSION,
            owner,
            status:          GameStatus::Idle,
            result:          GameResult::Pending,
            bet_amount:      0,
            commitment:      [0u8; 32],
            commit_slot:     0,
            resolve_slot:    0,
            forfeit_slot:    0,
            multiplier_bps:  0,
            last_slot_index: 0,
            last_payout:     0,
            rounds_played:   0,
            bump,
        }
    }

    /// Idle → BetPlaced. Nothing is written unless every check passes.
    pub fn place_bet(
        &mut self,
        player:     &mut PlayerAccount,
        treasury:   &Treasury,
        amount:     u64,
        commitment: [u8; 32],
        slot:       u64,
    ) -> Result<()> {
        require!(!treasury.paused,                   PlinkoError::ContractPaused);
        require!(self.status == GameStatus::Idle,    PlinkoError::InvalidState);
        require!(amount > 0,                         PlinkoError::InvalidAmount);
        require!(amount >= treasury.min_bet,         PlinkoError::BetTooSmall);
        require!(player.balance >= amount,           PlinkoError::InsufficientFunds);
        require_keys_eq!(player.owner, self.owner,   PlinkoError::Unauthorized);

        let worst = payout_for(amount, MAX_MULTIPLIER_BPS)?;
        require!(worst <= treasury.payout_cap(),     PlinkoError::BetExceedsLimit);

        let wagered = player.total_wagered.checked_add(amount).ok_or(PlinkoError::Overflow)?;
        transfer(player, self, amount)?;
        player.in_play       = amount;
        player.total_wagered = wagered;

        self.status         = GameStatus::BetPlaced;
        self.result         = GameResult::Pending;
        self.commitment     = commitment;
        self.commit_slot    = slot;
        self.resolve_slot   = resolve_slot_for(slot, amount);
        self.forfeit_slot   = self.resolve_slot.saturating_add(REVEAL_WINDOW);
        self.multiplier_bps = 0;
        Ok(())
    }

    /// Reveal preconditions: right phase, window open, nonce matches commitment.
    pub fn check_reveal(&self, nonce: &[u8; 32], slot: u64) -> Result<()> {
        require!(self.status == GameStatus::BetPlaced, PlinkoError::InvalidState);
        require!(
            slot >= self.resolve_slot.saturating_add(MIX_SLOTS as u64),
            PlinkoError::TooEarlyToReveal
        );
        require!(slot <= self.forfeit_slot, PlinkoError::RevealWindowExpired);
        require!(hash(nonce).to_bytes() == self.commitment, PlinkoError::InvalidNonce);
        Ok(())
    }

    /// BetPlaced → Settling. Only reachable from inside determine_result.
    pub fn lock_outcome(&mut self, outcome: Outcome) -> Result<()> {
        require!(self.status == GameStatus::BetPlaced, PlinkoError::InvalidState);
        self.last_slot_index = outcome.slot_index;
        self.multiplier_bps  = outcome.multiplier_bps;
        self.status          = GameStatus::Settling;
        Ok(())
    }

    /// BetPlaced | Settling → Error once the reveal window has closed. The
    /// stake goes to the house and the player ledger is released.
    pub fn expire(&mut self, player: &mut PlayerAccount, treasury: &mut Treasury, slot: u64) -> Result<u64> {
        require!(
            matches!(self.status, GameStatus::BetPlaced | GameStatus::Settling),
            PlinkoError::InvalidState
        );
        require!(slot > self.forfeit_slot, PlinkoError::RevealWindowOpen);
        require_keys_eq!(player.owner, self.owner, PlinkoError::Unauthorized);

        let stake = self.bet_amount;
        transfer(self, treasury, stake)?;
        player.in_play = 0;

        treasury.total_bets    = treasury.total_bets.saturating_add(1);
        treasury.total_wagered = treasury.total_wagered.saturating_add(stake);

        self.status         = GameStatus::Error;
        self.result         = GameResult::Lose;
        self.last_payout    = 0;
        self.multiplier_bps = 0;
        self.rounds_played  = self.rounds_played.saturating_add(1);
        Ok(stake)
    }

    /// The house authority may always reset. The owner may only reset a
    /// game holding no escrow, so a reset never returns a stake the owner
    /// could have settled.
    pub fn authorize_reset(&self, caller: &Pubkey, authority: &Pubkey) -> Result<()> {
        if caller == authority {
            return Ok(());
        }
        require_keys_eq!(*caller, self.owner, PlinkoError::Unauthorized);
        require!(self.bet_amount == 0, PlinkoError::Unauthorized);
        Ok(())
    }

    pub fn ensure_uninitialized(&self) -> Result<()> {
        require!(self.owner == Pubkey::default(), PlinkoError::AlreadyExists);
        Ok(())
    }

    /// Any state → Idle, escrow refunded to the player ledger.
    pub fn reset(&mut self, player: &mut PlayerAccount) -> Result<u64> {
        require_keys_eq!(player.owner, self.owner, PlinkoError::Unauthorized);
        let refund = self.bet_amount;
        transfer(self, player, refund)?;
        player.in_play = 0;

        self.status         = GameStatus::Idle;
        self.result         = GameResult::Pending;
        self.multiplier_bps = 0;
        Ok(refund)
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  SETTLEMENT ENGINE
// ══════════════════════════════════════════════════════════════════════════

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub owner:            Pubkey,
    pub stake:            u64,
    pub slot_index:       u8,
    pub multiplier_bps:   u64,
    pub payout:           u64,
    pub player_balance:   u64,
    pub treasury_balance: u64,
}

/// Settling → Idle.
///
/// ATOMIC DESIGN:
///   1. Pure math: payout and every resulting balance
///   2. Solvency: house (after absorbing the stake) must cover the payout
///   3. Escrow → treasury, treasury → player
///   4. Phase, result and counters
pub fn settle(
    game:     &mut GameAccount,
    player:   &mut PlayerAccount,
    treasury: &mut Treasury,
) -> Result<SettlementReceipt> {
    require!(game.status == GameStatus::Settling, PlinkoError::InvalidState);
    require_keys_eq!(player.owner, game.owner, PlinkoError::Unauthorized);

    // ── STEP 1: Pure math ───────────────────────────────────────
    let stake  = game.bet_amount;
    let payout = payout_for(stake, game.multiplier_bps)?;
    let house_with_stake = treasury.balance.checked_add(stake).ok_or(PlinkoError::Overflow)?;

    // ── STEP 2: Solvency ────────────────────────────────────────
    require!(house_with_stake >= payout, PlinkoError::HouseInsolvent);
    require!(player.balance.checked_add(payout).is_some(), PlinkoError::Overflow);

    // ── STEP 3: Ledger moves ────────────────────────────────────
    transfer(game, treasury, stake)?;
    transfer(treasury, player, payout)?;

    // ── STEP 4: Phase & counters ────────────────────────────────
    game.result = if payout > 0 {
        GameResult::Win { multiplier_bps: game.multiplier_bps }
    } else {
        GameResult::Lose
    };
    game.status        = GameStatus::Idle;
    game.last_payout   = payout;
    game.rounds_played = game.rounds_played.saturating_add(1);

    player.in_play   = 0;
    player.total_won = player.total_won.saturating_add(payout);

    treasury.total_bets     = treasury.total_bets.saturating_add(1);
    treasury.total_wagered  = treasury.total_wagered.saturating_add(stake);
    treasury.total_paid_out = treasury.total_paid_out.saturating_add(payout);
    if payout > treasury.biggest_win {
        treasury.biggest_win = payout;
    }

    Ok(SettlementReceipt {
        owner:            game.owner,
        stake,
        slot_index:       game.last_slot_index,
        multiplier_bps:   game.multiplier_bps,
        payout,
        player_balance:   player.balance,
        treasury_balance: treasury.balance,
    })
}

impl PlayerAccount {
    pub fn new(owner: Pubkey, bump: u8) -> Self {
        Self {
            version:         SCHEMA_VERSION,
            owner,
            balance:         0,
            in_play:         0,
            total_deposited: 0,
            total_wagered:   0,
            total_won:       0,
            bump,
        }
    }

    pub fn ensure_uninitialized(&self) -> Result<()> {
        require!(self.owner == Pubkey::default(), PlinkoError::AlreadyExists);
        Ok(())
    }

    pub fn record_deposit(&mut self, amount: u64) -> Result<()> {
        let deposited = self.total_deposited.checked_add(amount).ok_or(PlinkoError::Overflow)?;
        self.credit(amount)?;
        self.total_deposited = deposited;
        Ok(())
    }

    /// Zeroes the ledger for deallocation and reports what leaves with the owner.
    pub fn drain_for_close(&mut self) -> Result<u64> {
        require!(self.in_play == 0, PlinkoError::InvalidState);
        let paid_out = self.balance;
        self.balance = 0;
        Ok(paid_out)
    }
}

impl Treasury {
    pub fn new(authority: Pubkey, min_bet: u64, max_payout_bps: u16, starting_balance: u64, bump: u8) -> Self {
        Self {
            version: SCHEMA_VERSION,
            authority,
            balance: 0,
            min_bet,
            max_payout_bps,
            starting_balance,
            paused: false,
            total_bets: 0,
            total_wagered: 0,
            total_paid_out: 0,
            biggest_win: 0,
            bump,
        }
    }

    pub fn ensure_uninitialized(&self) -> Result<()> {
        require!(self.authority == Pubkey::default(), PlinkoError::AlreadyExists);
        Ok(())
    }

    /// Largest single payout the house accepts exposure to.
    pub fn payout_cap(&self) -> u64 {
        (self.balance as u128 * self.max_payout_bps as u128 / BPS_ONE as u128) as u64
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  ACCOUNTS
// ══════════════════════════════════════════════════════════════════════════

#[derive(Accounts)]
pub struct InitializeHouse<'info> {
    #[account(init_if_needed, payer = authority, space = 8 + Treasury::LEN,
              seeds = [TREASURY_SEED], bump)]
    pub treasury: Account<'info, Treasury>,
    #[account(mut)] pub authority: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct InitializePlayer<'info> {
    #[account(init_if_needed, payer = owner, space = 8 + PlayerAccount::LEN,
              seeds = [PLAYER_SEED, owner.key().as_ref()], bump)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    #[account(mut)] pub owner: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct DepositFunds<'info> {
    #[account(mut, seeds = [PLAYER_SEED, owner.key().as_ref()], bump = player_account.bump,
              has_one = owner @ PlinkoError::Unauthorized)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut)] pub owner: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct InitializeGame<'info> {
    #[account(init_if_needed, payer = owner, space = 8 + GameAccount::LEN,
              seeds = [GAME_SEED, owner.key().as_ref()], bump)]
    pub game_account: Account<'info, GameAccount>,
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    #[account(mut)] pub owner: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct TopUpGameAccount<'info> {
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    #[account(mut)] pub payer: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct PlaceBet<'info> {
    #[account(mut, seeds = [PLAYER_SEED, owner.key().as_ref()], bump = player_account.bump,
              has_one = owner @ PlinkoError::Unauthorized)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut, seeds = [GAME_SEED, owner.key().as_ref()], bump = game_account.bump,
              has_one = owner @ PlinkoError::Unauthorized)]
    pub game_account: Account<'info, GameAccount>,
    #[account(seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    pub owner: Signer<'info>,
}

#[derive(Accounts)]
pub struct DetermineResult<'info> {
    #[account(mut, seeds = [PLAYER_SEED, owner.key().as_ref()], bump = player_account.bump,
              has_one = owner @ PlinkoError::Unauthorized)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut, seeds = [GAME_SEED, owner.key().as_ref()], bump = game_account.bump,
              has_one = owner @ PlinkoError::Unauthorized)]
    pub game_account: Account<'info, GameAccount>,
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    pub owner: Signer<'info>,
    /// CHECK: address pinned to the SlotHashes sysvar
    #[account(address = slot_hashes::ID)]
    pub slot_hashes: UncheckedAccount<'info>,
}

#[derive(Accounts)]
pub struct ExpireBet<'info> {
    #[account(mut, seeds = [GAME_SEED, game_account.owner.as_ref()], bump = game_account.bump)]
    pub game_account: Account<'info, GameAccount>,
    #[account(mut, seeds = [PLAYER_SEED, game_account.owner.as_ref()], bump = player_account.bump)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    /// Permissionless: anyone can forfeit a stale bet.
    pub caller: Signer<'info>,
}

#[derive(Accounts)]
pub struct ResetGame<'info> {
    #[account(seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
    #[account(mut, seeds = [GAME_SEED, game_account.owner.as_ref()], bump = game_account.bump)]
    pub game_account: Account<'info, GameAccount>,
    #[account(mut, seeds = [PLAYER_SEED, game_account.owner.as_ref()], bump = player_account.bump)]
    pub player_account: Account<'info, PlayerAccount>,
    /// House authority, or the game owner once nothing is escrowed.
    pub caller: Signer<'info>,
}

#[derive(Accounts)]
pub struct ClosePlayerAccount<'info> {
    #[account(mut, close = owner, seeds = [PLAYER_SEED, owner.key().as_ref()],
              bump = player_account.bump, has_one = owner @ PlinkoError::Unauthorized)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(mut)] pub owner: Signer<'info>,
}

#[derive(Accounts)]
pub struct AdminOnly<'info> {
    #[account(mut, seeds = [TREASURY_SEED], bump = treasury.bump,
              has_one = authority @ PlinkoError::Unauthorized)]
    pub treasury: Account<'info, Treasury>,
    pub authority: Signer<'info>,
}

/// Migration context. Raw accounts because an outdated layout may be
/// smaller than the current struct (can't deserialize yet).
#[derive(Accounts)]
pub struct MigrateAccount<'info> {
    /// CHECK: Validated against the derived address, program ownership and size in the handler.
    #[account(mut)]
    pub target: UncheckedAccount<'info>,
    /// CHECK: Authority bytes read raw in the handler.
    #[account(seeds = [TREASURY_SEED], bump)]
    pub treasury: UncheckedAccount<'info>,
    #[account(mut)] pub authority: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct GetHouseStats<'info> {
    #[account(seeds = [TREASURY_SEED], bump = treasury.bump)]
    pub treasury: Account<'info, Treasury>,
}

#[derive(Accounts)]
pub struct GetPlayerSummary<'info> {
    #[account(seeds = [PLAYER_SEED, player_account.owner.as_ref()], bump = player_account.bump)]
    pub player_account: Account<'info, PlayerAccount>,
    #[account(seeds = [GAME_SEED, player_account.owner.as_ref()], bump = game_account.bump)]
    pub game_account: Account<'info, GameAccount>,
}

// ══════════════════════════════════════════════════════════════════════════
//  STATE
// ══════════════════════════════════════════════════════════════════════════
// `version` sits first after the discriminator in every account so
// migrate_account can read it without knowing the rest of the layout.

#[account]
pub struct PlayerAccount {
    pub version:         u8,      // 1
    pub owner:           Pubkey,  // 32
    pub balance:         u64,     // 8
    pub in_play:         u64,     // 8, mirrored escrow; blocks close while > 0
    pub total_deposited: u64,     // 8
    pub total_wagered:   u64,     // 8
    pub total_won:       u64,     // 8
    pub bump:            u8,      // 1
}
impl PlayerAccount { pub const LEN: usize = 1 + 32 + 8 + 8 + 8 + 8 + 8 + 1; }

#[account]
pub struct GameAccount {
    pub version:         u8,          // 1
    pub owner:           Pubkey,      // 32
    pub status:          GameStatus,  // 1
    pub result:          GameResult,  // 1 + 8 = 9
    pub bet_amount:      u64,         // 8, escrow
    pub commitment:      [u8; 32],    // 32, sha256(nonce)
    pub commit_slot:     u64,         // 8
    pub resolve_slot:    u64,         // 8
    pub forfeit_slot:    u64,         // 8
    pub multiplier_bps:  u64,         // 8
    pub last_slot_index: u8,          // 1
    pub last_payout:     u64,         // 8
    pub rounds_played:   u64,         // 8
    pub bump:            u8,          // 1
}
impl GameAccount { pub const LEN: usize = 1 + 32 + 1 + 9 + 8 + 32 + 8 + 8 + 8 + 8 + 1 + 8 + 8 + 1; }

#[account]
pub struct Treasury {
    pub version:          u8,      // 1
    pub authority:        Pubkey,  // 32
    pub balance:          u64,     // 8
    pub min_bet:          u64,     // 8
    pub max_payout_bps:   u16,     // 2
    pub starting_balance: u64,     // 8
    pub paused:           bool,    // 1
    // ── Transparency counters ──
    pub total_bets:       u64,     // 8
    pub total_wagered:    u64,     // 8
    pub total_paid_out:   u64,     // 8
    pub biggest_win:      u64,     // 8
    pub bump:             u8,      // 1
}
impl Treasury { pub const LEN: usize = 1 + 32 + 8 + 8 + 2 + 8 + 1 + 8 + 8 + 8 + 8 + 1; }

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameStatus {
    Idle,
    BetPlaced,
    Settling,
    Error,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameResult {
    Pending,
    Win { multiplier_bps: u64 },
    Lose,
}

#[derive(AnchorSerialize, AnchorDeserialize)]
pub struct HouseStats {
    pub balance:        u64,
    pub min_bet:        u64,
    pub payout_cap:     u64,
    pub paused:         bool,
    pub total_bets:     u64,
    pub total_wagered:  u64,
    pub total_paid_out: u64,
    pub biggest_win:    u64,
}

#[derive(AnchorSerialize, AnchorDeserialize)]
pub struct PlayerSummary {
    pub owner:         Pubkey,
    pub balance:       u64,
    pub in_play:       u64,
    pub status:        GameStatus,
    pub last_result:   GameResult,
    pub rounds_played: u64,
}

// ══════════════════════════════════════════════════════════════════════════
//  ERRORS & EVENTS
// ══════════════════════════════════════════════════════════════════════════

#[error_code]
pub enum PlinkoError {
    #[msg("Game is not in the required phase for this instruction")]
    InvalidState,
    #[msg("Insufficient funds in the player ledger")]
    InsufficientFunds,
    #[msg("Arithmetic overflow")]
    Overflow,
    #[msg("Account already exists")]
    AlreadyExists,
    #[msg("Account not found")]
    NotFound,
    #[msg("Signer is not the required authority")]
    Unauthorized,
    #[msg("Treasury cannot cover the payout")]
    HouseInsolvent,
    #[msg("No valid derived address for these seeds")]
    DerivationExhausted,
    #[msg("Amount must be greater than zero")]
    InvalidAmount,
    #[msg("Bet is below the house minimum")]
    BetTooSmall,
    #[msg("Worst-case payout exceeds the house cap")]
    BetExceedsLimit,
    #[msg("House is paused")]
    ContractPaused,
    #[msg("Nonce does not match the commitment")]
    InvalidNonce,
    #[msg("Too early to reveal")]
    TooEarlyToReveal,
    #[msg("Reveal window expired, wait for reset")]
    RevealWindowExpired,
    #[msg("Reveal window still open")]
    RevealWindowOpen,
    #[msg("Slot hash not found")]
    SlotHashNotFound,
    #[msg("Slot hash too old (>512 slots)")]
    SlotTooOld,
    #[msg("Invalid house configuration")]
    InvalidConfig,
    #[msg("Accounting invariant violated")]
    AccountingBroken,
}

#[event] pub struct HouseInitialized    { pub authority: Pubkey, pub min_bet: u64, pub max_payout_bps: u16, pub starting_balance: u64, pub balance: u64 }
#[event] pub struct PlayerInitialized   { pub owner: Pubkey, pub balance: u64 }
#[event] pub struct FundsDeposited      { pub owner: Pubkey, pub amount: u64, pub balance: u64 }
#[event] pub struct GameInitialized     { pub owner: Pubkey, pub initial_funding: u64, pub treasury_balance: u64 }
#[event] pub struct TreasuryToppedUp    { pub payer: Pubkey, pub amount: u64, pub balance: u64 }
#[event] pub struct BetPlaced           { pub owner: Pubkey, pub amount: u64, pub resolve_slot: u64, pub forfeit_slot: u64 }
#[event] pub struct GameSettled         { pub receipt: SettlementReceipt }
#[event] pub struct BetExpired          { pub owner: Pubkey, pub forfeited: u64, pub caller: Pubkey }
#[event] pub struct GameReset           { pub owner: Pubkey, pub caller: Pubkey, pub previous_status: GameStatus, pub refund: u64 }
#[event] pub struct PlayerAccountClosed { pub owner: Pubkey, pub paid_out: u64 }
#[event] pub struct HouseConfigUpdated  { pub min_bet: u64, pub max_payout_bps: u16, pub starting_balance: u64 }
#[event] pub struct PauseToggled        { pub paused: bool }
#[event] pub struct AccountMigrated     { pub account: Pubkey, pub kind: AccountKind, pub from_version: u8, pub to_version: u8, pub old_size: u32, pub new_size: u32 }
