//! Epoch and wallclock derivation from genesis parameters

const BYRON_SLOTS_PER_EPOCH: u64 = 21_600;
const BYRON_SLOT_SECONDS: u64 = 20;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenesisValues {
    pub byron_timestamp: u64,
    pub shelley_epoch: u64,
    pub shelley_epoch_len: u64,
}

impl GenesisValues {
    pub fn mainnet() -> Self {
        Self {
            byron_timestamp: 1506203091,
            shelley_epoch: 208,
            shelley_epoch_len: 432_000,
        }
    }

    /// Derive (epoch, slot-in-epoch) from a slot, handling the Byron/Shelley
    /// era change
    pub fn slot_to_epoch(&self, slot: u64) -> (u64, u64) {
        let shelley_start_slot = self.shelley_epoch * BYRON_SLOTS_PER_EPOCH;
        if slot < shelley_start_slot {
            (slot / BYRON_SLOTS_PER_EPOCH, slot % BYRON_SLOTS_PER_EPOCH)
        } else {
            let since_shelley = slot - shelley_start_slot;
            (
                self.shelley_epoch + since_shelley / self.shelley_epoch_len,
                since_shelley % self.shelley_epoch_len,
            )
        }
    }

    pub fn epoch_to_first_slot(&self, epoch: u64) -> u64 {
        if epoch < self.shelley_epoch {
            epoch * BYRON_SLOTS_PER_EPOCH
        } else {
            self.shelley_epoch * BYRON_SLOTS_PER_EPOCH
                + (epoch - self.shelley_epoch) * self.shelley_epoch_len
        }
    }

    pub fn slot_to_timestamp(&self, slot: u64) -> u64 {
        let shelley_start_slot = self.shelley_epoch * BYRON_SLOTS_PER_EPOCH;
        if slot < shelley_start_slot {
            self.byron_timestamp + slot * BYRON_SLOT_SECONDS
        } else {
            let shelley_timestamp = self.byron_timestamp + shelley_start_slot * BYRON_SLOT_SECONDS;
            shelley_timestamp + (slot - shelley_start_slot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byron_epoch_0() {
        let genesis = GenesisValues::mainnet();
        assert_eq!(genesis.slot_to_epoch(0), (0, 0));
        assert_eq!(genesis.slot_to_timestamp(0), 1506203091);
    }

    #[test]
    fn byron_last_slot() {
        let genesis = GenesisValues::mainnet();
        assert_eq!(genesis.slot_to_epoch(4_492_799), (207, 21_599));
        assert_eq!(genesis.slot_to_timestamp(4_492_799), 1596059071);
    }

    #[test]
    fn shelley_first_slot() {
        let genesis = GenesisValues::mainnet();
        assert_eq!(genesis.slot_to_epoch(4_492_800), (208, 0));
        assert_eq!(genesis.epoch_to_first_slot(208), 4_492_800);
        assert_eq!(genesis.slot_to_timestamp(4_492_800), 1596059091);
    }

    #[test]
    fn shelley_next_epoch() {
        let genesis = GenesisValues::mainnet();
        assert_eq!(genesis.slot_to_epoch(4_492_800 + 432_000), (209, 0));
        assert_eq!(genesis.epoch_to_first_slot(209), 4_492_800 + 432_000);
    }
}
