//! Rating histogram and the two scores derived from it.

use serde::{Deserialize, Serialize};

use crate::model::{RATING_BUCKETS, RATING_DEFAULT, RATING_MIN};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteStats {
    /// `histogram[i]` counts votes with rating `RATING_MIN + i`.
    pub histogram: [u32; RATING_BUCKETS],
    pub votes: u32,
    pub popularity: f32,
    pub controversy: f32,
}

fn bucket(rating: u8) -> usize {
    (rating - RATING_MIN) as usize
}

impl QuoteStats {
    /// Moves one vote from `previous` (if any) to `rating`. Ratings must be in range.
    pub fn shift(&mut self, previous: Option<u8>, rating: u8) {
        if let Some(old) = previous {
            let b = &mut self.histogram[bucket(old)];
            *b = b.saturating_sub(1);
        }
        self.histogram[bucket(rating)] += 1;
    }

    /// Recomputes vote count, popularity and controversy from the histogram.
    ///
    /// Popularity is normalized by the whole user population rather than the
    /// number of voters, so a quote few people rated stays close to neutral.
    /// Controversy is the population variance of the ratings.
    pub fn recompute(&mut self, total_users: usize) {
        let mut num: i64 = 0;
        let mut sum: i64 = 0;
        for (i, &amount) in self.histogram.iter().enumerate() {
            let rating = i as i64 + RATING_MIN as i64;
            num += amount as i64;
            sum += amount as i64 * (rating - RATING_DEFAULT as i64);
        }

        if num == 0 {
            self.votes = 0;
            self.popularity = 0.0;
            self.controversy = 0.0;
            return;
        }

        let default = RATING_DEFAULT as f32;
        self.votes = num as u32;
        self.popularity = sum as f32 / total_users.max(1) as f32 + default;

        let mean = sum as f32 / num as f32 + default;
        let mut spread = 0.0f32;
        for (i, &amount) in self.histogram.iter().enumerate() {
            let d = (i as f32 + RATING_MIN as f32) - mean;
            spread += amount as f32 * d * d;
        }
        self.controversy = spread / num as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(histogram: [u32; RATING_BUCKETS], users: usize) -> QuoteStats {
        let mut s = QuoteStats { histogram, ..Default::default() };
        s.recompute(users);
        s
    }

    #[test]
    fn empty_histogram_scores_zero() {
        let s = stats([0; RATING_BUCKETS], 10);
        assert_eq!(s.votes, 0);
        assert_eq!(s.popularity, 0.0);
        assert_eq!(s.controversy, 0.0);
    }

    #[test]
    fn popularity_is_normalized_by_user_population() {
        // two 5-star votes among 4 users: sum = 2 * (5 - 3) = 4
        let s = stats([0, 0, 0, 0, 2], 4);
        assert_eq!(s.votes, 2);
        assert!((s.popularity - 4.0).abs() < 1e-6);
        assert!(s.controversy.abs() < 1e-6);
    }

    #[test]
    fn controversy_is_population_variance() {
        // one 1 and one 5: mean 3, variance ((1-3)^2 + (5-3)^2) / 2 = 4
        let s = stats([1, 0, 0, 0, 1], 2);
        assert!((s.popularity - 3.0).abs() < 1e-6);
        assert!((s.controversy - 4.0).abs() < 1e-6);
    }

    #[test]
    fn zero_users_does_not_divide_by_zero() {
        let s = stats([0, 0, 0, 1, 0], 0);
        assert!((s.popularity - 4.0).abs() < 1e-6);
    }

    #[test]
    fn shift_moves_a_single_vote() {
        let mut s = QuoteStats::default();
        s.shift(None, 2);
        s.shift(Some(2), 5);
        assert_eq!(s.histogram, [0, 0, 0, 0, 1]);
    }
}
