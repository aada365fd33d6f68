//! The early stop predicate over recorded accuracies.

/// Checks whether every accuracy series converged.
///
/// With `top_cnt`, a series converged once its best value is more than `top_cnt` entries old.
/// With `div_value`, once the standard deviation of its last `top_cnt` entries (all entries
/// without `top_cnt`) is below `div_value`. With both, both must hold. With neither, nothing ever
/// converges.
pub fn check_done(acc_lss: &[&[f64]], top_cnt: Option<usize>, div_value: Option<f64>) -> bool {
    if top_cnt.is_none() && div_value.is_none() {
        return false;
    }
    acc_lss.iter().all(|acc_ls| {
        let top = top_cnt.map_or(true, |top_cnt| best_is_stale(acc_ls, top_cnt));
        let div = div_value.map_or(true, |div_value| {
            let window = top_cnt.unwrap_or(acc_ls.len());
            is_flat(acc_ls, window, div_value)
        });
        top && div
    })
}

fn best_is_stale(acc_ls: &[f64], top_cnt: usize) -> bool {
    let best = acc_ls
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (index, &acc)| match best {
            Some((_, max)) if max >= acc => best,
            _ => Some((index, acc)),
        });
    match best {
        Some((index, _)) => acc_ls.len() - index > top_cnt,
        None => false,
    }
}

fn is_flat(acc_ls: &[f64], window: usize, div_value: f64) -> bool {
    if window == 0 || acc_ls.len() < window {
        return false;
    }
    let tail = &acc_ls[acc_ls.len() - window..];
    let mean = tail.iter().sum::<f64>() / window as f64;
    let variance = tail.iter().map(|acc| (acc - mean).powi(2)).sum::<f64>() / window as f64;
    variance.sqrt() < div_value
}
