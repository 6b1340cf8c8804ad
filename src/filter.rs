//! Windowed Maxwell filter.
//!
//! The recording is cut into buffers (tSSS windows, or 10 s chunks that only
//! pace pose updates). Every buffer is split into pose segments; each segment
//! is projected onto the internal multipole moments of the decomposition for
//! its pose and rebuilt at the destination pose. State carried between
//! buffers (the active decomposition and the last reported position) is an
//! explicit value passed in and returned by [`process_buffer`].

use std::rc::Rc;

use chrono::Utc;
use nalgebra::DMatrix;
use ndarray::{s, Array2};
use serde::Serialize;

use crate::basis::{n_moments, trans_sss_basis, CoilScale, Expansion};
use crate::calibration::update_sensor_geometry;
use crate::config::{MagScale, MaxwellParams};
use crate::decomposition::{Decomposition, DecompositionBuilder, DecompositionCache};
use crate::error::{MaxwellError, Result};
use crate::geometry::{prep_mf_coils, CoilType};
use crate::pose::{pos_data_from_trans, PosData, PoseStream, POS_DATA_LEN};
use crate::recording::{
    ChannelInfo, ChannelKind, MaxInfo, MaxSt, MeasInfo, ProcessingRecord, Recording, SssCal,
    SssCtc, SssInfo,
};
use crate::tsss::do_tsss;
use crate::types::{dmatrix_from_view, select_columns, select_rows, CoordFrame, Transform};
use crate::windowing::{st_buffer_len, Windows};

/// Warn when the destination is further than this from the recorded pose [mm]
const MAX_DESTINATION_SHIFT_MM: f64 = 25.0;

/// Processing-history job codes
const SSS_JOB: i32 = 2;
const TSSS_JOB: i32 = 10;

/// When the temporal projection runs relative to movement compensation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemporalMode {
    Never,
    /// On the raw buffer, with the buffer's average pose
    Before,
    /// On the reconstructed buffer, segment by segment
    After,
}

/// Diagnostics of one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterReport {
    pub n_buffers: usize,
    pub decompositions_computed: usize,
    /// Projected tSSS components per buffer (empty without tSSS)
    pub tsss_components: Vec<usize>,
    /// Head positions used per buffer
    pub head_positions: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct MaxwellOutput {
    pub raw: Recording,
    pub report: FilterReport,
}

/// Channel selections of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct MfPicks {
    /// MEG channels used for filtering (channel indices)
    pub meg: Vec<usize>,
    /// Positions in `meg` of the good channels
    pub good: Vec<usize>,
    /// Per `meg` entry: reported in T
    pub mag: Vec<bool>,
    /// Per `meg` entry: sees the degree-1 external field
    pub mag_or_fine: Vec<bool>,
}

impl MfPicks {
    /// Channel indices of the good MEG channels
    pub fn good_channels(&self) -> Vec<usize> {
        self.good.iter().map(|&g| self.meg[g]).collect()
    }
}

/// Pick the channels to filter; the good ones must outnumber the moments.
pub fn mf_picks(info: &MeasInfo, n_bases: usize, ignore_ref: bool) -> Result<MfPicks> {
    let meg = info.meg_picks(!ignore_ref);
    let good: Vec<usize> = meg
        .iter()
        .enumerate()
        .filter(|(_, &idx)| !info.is_bad(&info.channels[idx].name))
        .map(|(pos, _)| pos)
        .collect();
    if n_bases > good.len() {
        return Err(MaxwellError::TooManyMoments {
            requested: n_bases,
            available: good.len(),
        });
    }
    let recons: Vec<&str> = meg
        .iter()
        .map(|&idx| info.channels[idx].name.as_str())
        .filter(|name| info.is_bad(name))
        .collect();
    if recons.is_empty() {
        log::info!("    No bad MEG channels");
    } else {
        log::info!("    Bad MEG channels being reconstructed: {recons:?}");
    }
    let coil_types: Vec<&CoilType> = meg.iter().map(|&idx| &info.channels[idx].coil_type).collect();
    let mag: Vec<bool> = coil_types.iter().map(|c| c.is_tesla()).collect();
    let mag_or_fine: Vec<bool> = coil_types
        .iter()
        .map(|c| c.is_tesla() && !c.is_axial_gradiometer())
        .collect();
    let n_mag = mag.iter().filter(|&&m| m).count();
    let n_axial = n_mag - mag_or_fine.iter().filter(|&&m| m).count();
    if n_axial > 0 {
        log::info!(
            "    Processing {} gradiometers and {n_mag} magnetometers (of which {n_axial} are actually axial gradiometers)",
            meg.len() - n_mag
        );
    } else {
        log::info!("    Processing {} gradiometers and {n_mag} magnetometers", meg.len() - n_mag);
    }
    Ok(MfPicks {
        meg,
        good,
        mag,
        mag_or_fine,
    })
}

/// Reject stages that an earlier run already applied.
pub fn check_info(info: &MeasInfo, sss: bool, tsss: bool, calibration: bool, ctc: bool) -> Result<()> {
    for record in &info.proc_history {
        let done = &record.max_info;
        for (name, applied, doing) in [
            ("SSS", done.sss_info.is_some(), sss),
            ("tSSS", done.max_st.is_some(), tsss),
            ("fine calibration", done.sss_cal.is_some(), calibration),
            ("cross-talk cancellation", done.sss_ctc.is_some(), ctc),
        ] {
            if doing && applied {
                return Err(MaxwellError::AlreadyProcessed(name.to_string()));
            }
        }
    }
    Ok(())
}

/// Active projectors and software compensation make the data unusable.
pub fn check_usable(info: &MeasInfo) -> Result<()> {
    if info.has_active_projectors() {
        return Err(MaxwellError::Unusable(
            "projectors cannot be applied to data".to_string(),
        ));
    }
    if info.comp_grade != 0 {
        return Err(MaxwellError::Unusable(format!(
            "Maxwell filter cannot be done on compensated channels, but data have been compensated with grade {}",
            info.comp_grade
        )));
    }
    Ok(())
}

/// Output copy of `raw`: MEG projectors dropped, position channels appended on request.
fn prepare_output(raw: &Recording, add_pos_channels: bool) -> Recording {
    let mut info = raw.info.clone();
    info.projs = info.without_meg_projectors();
    if !add_pos_channels {
        log::info!("    Using loaded raw data");
        return Recording {
            info,
            data: raw.data.clone(),
            first_samp: raw.first_samp,
        };
    }
    log::info!("    Appending head position result channels and copying original raw data");
    let n_ch = info.n_channels();
    let mut data = Array2::zeros((n_ch + POS_DATA_LEN, raw.n_samples()));
    data.slice_mut(s![..n_ch, ..]).assign(&raw.data);
    info.channels.extend((1..=POS_DATA_LEN).map(|ii| ChannelInfo {
        name: format!("CHPI{ii:03}"),
        kind: ChannelKind::Chpi,
        coil_type: CoilType::None,
        loc: [0.0; 12],
    }));
    Recording {
        info,
        data,
        first_samp: raw.first_samp,
    }
}

/// Fixed inputs of the per-buffer step.
#[derive(Debug)]
pub struct BufferSetup {
    pub picks: MfPicks,
    /// Cross-talk decoupler over the good channels
    pub ctc: Option<DMatrix<f64>>,
    /// Internal basis of every filtered channel at the destination pose
    pub recon: DMatrix<f64>,
    pub mode: TemporalMode,
    pub st_correlation: f64,
    pub st_only: bool,
    pub poses: PoseStream,
    /// Pose assumed until the first position arrives
    pub initial_trans: Option<Transform>,
    pub has_pos_channels: bool,
    pub sfreq: f64,
}

impl BufferSetup {
    /// `current`, or the decomposition at the initial pose when nothing applied yet.
    fn current_or_initial(
        &self,
        cache: &mut DecompositionCache,
        current: Option<Rc<Decomposition>>,
        t: f64,
    ) -> Result<Rc<Decomposition>> {
        match current {
            Some(decomp) => Ok(decomp),
            None => cache.get(self.initial_trans.as_ref(), t),
        }
    }
}

/// State handed from one buffer to the next.
#[derive(Clone, Debug)]
pub struct BufferState {
    /// Decomposition of the last segment processed; `None` before the first one
    pub decomp: Option<Rc<Decomposition>>,
    /// Position reported before the first pose inside a buffer
    pub pos_data: Option<PosData>,
}

/// Filtered samples of one buffer.
#[derive(Clone, Debug)]
pub struct BufferOutput {
    /// Rows follow `picks.meg`
    pub meg: DMatrix<f64>,
    pub pos: Option<DMatrix<f64>>,
    pub n_tsss: Option<usize>,
    pub n_positions: usize,
}

/// Filter `data` (every channel, samples `start..stop` of the recording).
pub fn process_buffer(
    setup: &BufferSetup,
    cache: &mut DecompositionCache,
    state: BufferState,
    data: &DMatrix<f64>,
    (start, stop): (usize, usize),
    t_str: &str,
) -> Result<(BufferOutput, BufferState)> {
    let len = stop - start;
    let time_of = |rel: usize| (start + rel) as f64 / setup.sfreq;

    let mut orig = select_rows(data, &setup.picks.good_channels());
    if let Some(ctc) = &setup.ctc {
        orig = ctc * orig;
    }
    let mut out_meg = select_rows(data, &setup.picks.meg);
    let plan = setup.poses.plan(start, stop, state.pos_data)?;
    let n_positions = plan.segments.len();

    let mut decomp = state.decomp;
    let mut n_tsss = None;
    if setup.mode == TemporalMode::Before {
        let decomp_st = match &plan.avg_trans {
            Some(avg) => cache.get(Some(avg), time_of(0))?,
            None => {
                let current = setup.current_or_initial(cache, decomp.take(), time_of(0))?;
                decomp = Some(Rc::clone(&current));
                current
            }
        };
        let (orig_in, resid) = decomp_st.split(&orig);
        if setup.st_only {
            let (projected, n) = do_tsss(&out_meg, &orig_in, &resid, setup.st_correlation, n_positions, t_str)?;
            out_meg = projected;
            n_tsss = Some(n);
        } else {
            let (projected, n) = do_tsss(&orig, &orig_in, &resid, setup.st_correlation, n_positions, t_str)?;
            orig = projected;
            n_tsss = Some(n);
        }
    }

    let mut pos_data = state.pos_data;
    let mut pos_out = setup
        .has_pos_channels
        .then(|| DMatrix::zeros(POS_DATA_LEN, len));
    let mut after = (setup.mode == TemporalMode::After).then(|| {
        (
            DMatrix::zeros(orig.nrows(), len),
            DMatrix::zeros(orig.nrows(), len),
        )
    });
    if !setup.st_only || setup.mode == TemporalMode::After {
        for seg in &plan.segments {
            let current = match &seg.trans {
                Some(trans) => cache.get(Some(trans), time_of(seg.start))?,
                None => setup.current_or_initial(cache, decomp.take(), time_of(seg.start))?,
            };
            let seg_data = orig.columns(seg.start, seg.len()).into_owned();
            let mm_in = current.internal_moments(&seg_data);
            if !setup.st_only {
                let recon = select_columns(&setup.recon, &current.reg_moments[..current.n_use_in]);
                out_meg
                    .columns_mut(seg.start, seg.len())
                    .copy_from(&(recon * &mm_in));
            }
            pos_data = seg.pos_data;
            if let (Some(pos_out), Some(values)) = (pos_out.as_mut(), seg.pos_data) {
                for (row, value) in values.iter().enumerate() {
                    pos_out.view_mut((row, seg.start), (1, seg.len())).fill(*value);
                }
            }
            if let Some((orig_in, resid)) = after.as_mut() {
                let seg_in = current.basis.columns(0, current.n_use_in) * &mm_in;
                let seg_resid = &seg_data - current.external_field(&seg_data) - &seg_in;
                orig_in.columns_mut(seg.start, seg.len()).copy_from(&seg_in);
                resid.columns_mut(seg.start, seg.len()).copy_from(&seg_resid);
            }
            decomp = Some(current);
        }
    }

    if let Some((orig_in, resid)) = &after {
        let (projected, n) = do_tsss(&out_meg, orig_in, resid, setup.st_correlation, n_positions, t_str)?;
        out_meg = projected;
        n_tsss = Some(n);
    } else if setup.mode == TemporalMode::Never && !setup.poses.is_empty() {
        let pl = if n_positions > 1 { "s" } else { "" };
        log::info!("        Used {n_positions:2} head position{pl} for {t_str}");
    }

    Ok((
        BufferOutput {
            meg: out_meg,
            pos: pos_out,
            n_tsss,
            n_positions,
        },
        BufferState { decomp, pos_data },
    ))
}

fn write_rows(data: &mut Array2<f64>, rows: impl IntoIterator<Item = usize>, start: usize, block: &DMatrix<f64>) {
    for (src, dst) in rows.into_iter().enumerate() {
        for col in 0..block.ncols() {
            data[[dst, start + col]] = block[(src, col)];
        }
    }
}

/// Provenance record of a run, prepended to the history of the output.
#[allow(clippy::too_many_arguments)]
fn update_sss_info(
    mut info: MeasInfo,
    exp: &Expansion,
    nchan: usize,
    coord_frame: CoordFrame,
    sss_ctc: Option<SssCtc>,
    sss_cal: Option<SssCal>,
    max_st: Option<MaxSt>,
    reg_moments: &[usize],
    st_only: bool,
) -> MeasInfo {
    let n_in = exp.n_in();
    let mut components = vec![0i32; exp.n_total()];
    for &m in reg_moments {
        components[m] = 1;
    }
    let nfree = components[..n_in].iter().filter(|&&c| c == 1).count();
    let max_info = if st_only {
        MaxInfo {
            max_st,
            ..Default::default()
        }
    } else {
        let meg: Vec<String> = info
            .channels
            .iter()
            .filter(|ch| ch.is_meg(false))
            .map(|ch| ch.name.clone())
            .collect();
        info.bads.retain(|bad| !meg.contains(bad));
        MaxInfo {
            sss_info: Some(SssInfo {
                in_order: exp.int_order,
                out_order: exp.ext_order,
                nchan,
                origin: [exp.origin[0] as f32, exp.origin[1] as f32, exp.origin[2] as f32],
                job: SSS_JOB,
                nfree,
                frame: coord_frame,
                components,
            }),
            max_st,
            sss_cal,
            sss_ctc,
        }
    };
    let now = Utc::now();
    let record = ProcessingRecord {
        block_id: format!("{:08x}.{:06}", now.timestamp(), now.timestamp_subsec_micros()),
        creator: format!("maxwell_filter v{}", env!("CARGO_PKG_VERSION")),
        date: now.to_rfc3339(),
        experimenter: String::new(),
        max_info,
    };
    info.proc_history.insert(0, record);
    info
}

/// Maxwell filter (SSS), optionally with movement compensation and tSSS.
pub fn maxwell_filter(raw: &Recording, params: &MaxwellParams) -> Result<MaxwellOutput> {
    raw.check_consistency()?;
    params.validate(&raw.info)?;
    let n_samples = raw.n_samples();
    let sfreq = raw.info.sfreq;
    let head_frame = params.coord_frame == CoordFrame::Head;
    let st_len = params
        .st_duration
        .map(|d| st_buffer_len(d, sfreq, n_samples))
        .transpose()?;
    let recon_trans = params.resolve_destination(&raw.info)?;
    let recon_frame_trans = recon_trans.clone().filter(|_| head_frame);
    let poses = match &params.head_pos {
        Some(positions) => PoseStream::new(
            positions,
            params.coord_frame,
            params.st_fixed,
            raw.first_samp,
            n_samples,
            sfreq,
        )?,
        None => PoseStream::default(),
    };
    check_info(
        &raw.info,
        !params.st_only,
        st_len.is_some(),
        !params.st_only && params.calibration.is_some(),
        !params.st_only && params.cross_talk.is_some(),
    )?;
    check_usable(&raw.info)?;

    log::info!("Maxwell filtering raw data");
    let has_pos_channels = params.head_pos.is_some() && !params.st_only;
    let raw_sss = prepare_output(raw, has_pos_channels);
    let n_bases = n_moments(params.int_order) + n_moments(params.ext_order);
    let picks = mf_picks(&raw_sss.info, n_bases, params.ignore_ref)?;

    let mag_scale = params.mag_scale.resolve(&raw_sss.info, &picks.meg)?;
    if params.mag_scale == MagScale::Auto {
        log::info!("    Setting mag_scale={mag_scale:.2}");
    }
    let coil_scale: Vec<f64> = picks
        .mag
        .iter()
        .map(|&m| if m { mag_scale } else { 1.0 })
        .collect();

    let (info, calibration, sss_cal, mag_or_fine) = match &params.calibration {
        Some(fine_cal) => {
            let calibrated = update_sensor_geometry(&raw_sss.info, fine_cal, params.ignore_ref)?;
            (
                calibrated.info,
                Some(calibrated.calibration),
                Some(calibrated.sss_cal),
                vec![true; picks.meg.len()],
            )
        }
        None => (raw_sss.info.clone(), None, None, picks.mag_or_fine.clone()),
    };

    let origin = params.resolve_origin(&info)?;
    let exp = Expansion::new(origin, params.int_order, params.ext_order);

    let ctc = params
        .cross_talk
        .as_ref()
        .map(|ct| ct.restricted(&info, &picks.meg, &picks.good_channels()))
        .transpose()?;
    let sss_ctc = params.cross_talk.as_ref().map(|ct| ct.history_record());

    let coils = prep_mf_coils(&info, params.ignore_ref)?;
    let recon = trans_sss_basis(
        &exp.internal_only(),
        &coils,
        recon_frame_trans.as_ref(),
        CoilScale::Magnetometers(1.0),
    );
    if let (Some(recon_trans), Some(dev_head_t)) = (&recon_trans, &info.dev_head_t) {
        let diff = (dev_head_t.translation() - recon_trans.translation()) * 1e3;
        let dist = diff.norm();
        if dist > MAX_DESTINATION_SHIFT_MM {
            log::warn!(
                "Head position change is over 25 mm ({:.1}, {:.1}, {:.1}) = {dist:.1} mm",
                diff[0],
                diff[1],
                diff[2]
            );
        }
    }

    let max_st = st_len.map(|len| {
        let buflen = len as f64 / sfreq;
        log::info!("    Processing data using tSSS with st_duration={buflen}");
        MaxSt {
            job: TSSS_JOB,
            subspcorr: params.st_correlation,
            buflen,
        }
    });
    let mode = match st_len {
        Some(_) if params.st_fixed => TemporalMode::Before,
        Some(_) => TemporalMode::After,
        None => TemporalMode::Never,
    };
    let windows = match st_len {
        Some(len) => Windows::new(n_samples, len)?,
        None => Windows::default_chunks(n_samples, sfreq)?,
    };
    if windows.merged_tail && mode != TemporalMode::Never && windows.len() >= 2 {
        let n = windows.limits.len();
        log::info!(
            "    Spatiotemporal window did not fit evenly into raw object. The final {:.2} seconds were lumped onto the previous window.",
            (windows.limits[n - 1] - windows.limits[n - 2]) as f64 / sfreq
        );
    }

    let good_rows = picks.good.clone();
    let mut cache = DecompositionCache::new(DecompositionBuilder {
        exp: exp.clone(),
        coils,
        calibration,
        regularize: params.regularize,
        stopping_rule: params.stopping_rule,
        bad_condition: params.bad_condition,
        mag_scale,
        coil_scale,
        good_rows,
        mag_or_fine,
    });
    let frame_trans: Option<Transform> = info.dev_head_t.clone().filter(|_| head_frame);
    let mut state = BufferState {
        decomp: None,
        pos_data: frame_trans
            .as_ref()
            .filter(|_| has_pos_channels)
            .map(pos_data_from_trans),
    };

    let n_good = picks.good.len();
    let setup = BufferSetup {
        picks,
        ctc,
        recon,
        mode,
        st_correlation: params.st_correlation,
        st_only: params.st_only,
        poses,
        initial_trans: frame_trans,
        has_pos_channels,
        sfreq,
    };

    let n_buffers = windows.len();
    let pl = if n_buffers != 1 { "s" } else { "" };
    log::info!(
        "    Processing {n_buffers} data chunk{pl} of (at least) {:.1} sec",
        windows.buffer_len as f64 / sfreq
    );
    let width = n_buffers.to_string().len();
    let mut data = raw_sss.data;
    let pos_rows: Vec<usize> = if has_pos_channels {
        (info.n_channels() - POS_DATA_LEN..info.n_channels()).collect()
    } else {
        Vec::new()
    };
    let mut report = FilterReport {
        n_buffers,
        ..Default::default()
    };
    for (ii, (start, stop)) in windows.iter().enumerate() {
        let t_str = format!(
            "{:8.3} - {:8.3} sec (#{:>width$}/{n_buffers})",
            start as f64 / sfreq,
            (stop - 1) as f64 / sfreq,
            ii + 1
        );
        let block = dmatrix_from_view(data.slice(s![.., start..stop]));
        let (out, next) = process_buffer(&setup, &mut cache, state, &block, (start, stop), &t_str)?;
        state = next;
        write_rows(&mut data, setup.picks.meg.iter().copied(), start, &out.meg);
        if let Some(pos) = &out.pos {
            write_rows(&mut data, pos_rows.iter().copied(), start, pos);
        }
        if let Some(n) = out.n_tsss {
            report.tsss_components.push(n);
        }
        report.head_positions.push(out.n_positions);
    }
    let reg_moments_0 = match cache.first() {
        Some(first) => first.reg_moments.clone(),
        None => cache.get(setup.initial_trans.as_ref(), 0.0)?.reg_moments.clone(),
    };
    report.decompositions_computed = cache.computed();

    let info = MeasInfo {
        dev_head_t: recon_trans,
        ..info
    };
    let info = update_sss_info(
        info,
        &exp,
        n_good,
        params.coord_frame,
        sss_ctc,
        sss_cal,
        max_st,
        &reg_moments_0,
        params.st_only,
    );
    log::info!("[done]");
    Ok(MaxwellOutput {
        raw: Recording {
            info,
            data,
            first_samp: raw_sss.first_samp,
        },
        report,
    })
}
